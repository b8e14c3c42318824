#![forbid(unsafe_code)]

//! Process- and path-level safety checks shared by the backend.

use anyhow::{Result, bail};
use nix::unistd::Uid;
use std::path::{Component, Path};

/// Refuses to start when launched as root. The backend writes into the
/// download directory and spawns yt-dlp; a regular service account is the
/// only sensible way to run it.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} refuses to run as root; use an unprivileged service account");
    }
    Ok(())
}

/// Validates that a user-supplied path segment (a filename from the URL)
/// cannot escape its base directory. Rejects empty values, `..`, absolute
/// paths, and anything with a separator in it.
pub fn is_safe_path_segment(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    Path::new(value)
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
        && !value.contains('/')
        && !value.contains('\\')
}
