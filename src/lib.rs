#![forbid(unsafe_code)]

//! Shared library for the vidbridge backend: configuration, URL handling,
//! the yt-dlp extraction layer, format selection, search, and the download
//! job store. The HTTP surface lives in `src/bin/backend.rs`.

pub mod config;
pub mod extractor;
pub mod formats;
pub mod jobs;
pub mod metadata;
pub mod search;
pub mod security;
pub mod urls;
pub mod youtube_api;
