#![forbid(unsafe_code)]

//! Hybrid search: official API first when a key is configured, yt-dlp
//! `ytsearch` otherwise or whenever the API comes back empty or failing.

use anyhow::Result;

use crate::extractor;
use crate::metadata::{Provenance, SearchEntry, SearchResult};
use crate::youtube_api::YoutubeApiClient;

/// Artist mode over-fetches by this factor before filtering by uploader,
/// since yt-dlp has no channel-scoped search syntax.
const ARTIST_OVERFETCH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Video,
    Artist,
}

impl SearchMode {
    /// Unknown or absent mode strings mean a plain video search.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(ref v) if v == "artist" => Self::Artist,
            _ => Self::Video,
        }
    }
}

#[derive(Debug)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub source: Provenance,
}

/// Seam between the orchestration and the official API so the fallback
/// decision stays testable without network access.
pub trait ApiSearch {
    fn search_videos(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>>;
    fn search_by_artist(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>>;
}

impl ApiSearch for YoutubeApiClient {
    fn search_videos(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        YoutubeApiClient::search_videos(self, query, max_results)
    }

    fn search_by_artist(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        YoutubeApiClient::search_by_artist(self, query, max_results)
    }
}

/// Runs a search, preferring the official API and falling back to yt-dlp on
/// a missing key, an API failure, or an empty API result.
pub fn hybrid_search(
    api: Option<&dyn ApiSearch>,
    mode: SearchMode,
    query: &str,
    max_results: usize,
) -> Result<SearchOutcome> {
    if let Some(client) = api {
        let attempt = match mode {
            SearchMode::Video => client.search_videos(query, max_results),
            SearchMode::Artist => client.search_by_artist(query, max_results),
        };
        match attempt {
            Ok(results) if !results.is_empty() => {
                return Ok(SearchOutcome {
                    results,
                    source: Provenance::OfficialApi,
                });
            }
            Ok(_) => {
                tracing::info!(query, "official API returned no results; falling back");
                // The API answered. The fallback only changes provenance when
                // it actually adds results; an equally-empty (or failing)
                // fallback leaves the API's own empty answer standing.
                let fallback = extractor_search(mode, query, max_results).unwrap_or_else(|err| {
                    tracing::warn!(query, "fallback search failed: {err:#}");
                    Vec::new()
                });
                let source = if fallback.is_empty() {
                    Provenance::OfficialApi
                } else {
                    Provenance::Extractor
                };
                return Ok(SearchOutcome {
                    results: fallback,
                    source,
                });
            }
            Err(err) => {
                tracing::warn!(query, "official API search failed: {err:#}");
            }
        }
    }

    Ok(SearchOutcome {
        results: extractor_search(mode, query, max_results)?,
        source: Provenance::Extractor,
    })
}

fn extractor_search(mode: SearchMode, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
    Ok(match mode {
        SearchMode::Video => extractor::search(query, max_results)?
            .into_iter()
            .filter_map(SearchEntry::into_search_result)
            .collect(),
        SearchMode::Artist => {
            let entries = extractor::search(query, max_results * ARTIST_OVERFETCH)?;
            filter_by_artist(entries, query, max_results)
        }
    })
}

/// Client-side stand-in for channel-scoped search: keep entries whose
/// uploader contains the query, case-insensitively.
fn filter_by_artist(
    entries: Vec<SearchEntry>,
    query: &str,
    max_results: usize,
) -> Vec<SearchResult> {
    let needle = query.to_lowercase();
    let mut filtered = Vec::new();
    for entry in entries {
        if entry.uploader_name().to_lowercase().contains(&needle) {
            if let Some(result) = entry.into_search_result() {
                filtered.push(result);
            }
        }
        if filtered.len() >= max_results {
            break;
        }
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::set_ytdlp_stub_path;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    fn entry(id: &str, uploader: &str) -> SearchEntry {
        SearchEntry {
            id: Some(id.to_string()),
            title: Some(format!("video by {uploader}")),
            uploader: Some(uploader.to_string()),
            ..Default::default()
        }
    }

    fn write_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("yt-dlp-stub.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn mode_parsing_defaults_to_video() {
        assert_eq!(SearchMode::parse(None), SearchMode::Video);
        assert_eq!(SearchMode::parse(Some("video")), SearchMode::Video);
        assert_eq!(SearchMode::parse(Some("ARTIST")), SearchMode::Artist);
        assert_eq!(SearchMode::parse(Some("bogus")), SearchMode::Video);
    }

    #[test]
    fn artist_filter_matches_uploader_substring() {
        let entries = vec![
            entry("aaa00000001", "Rick Astley"),
            entry("aaa00000002", "Some Tribute Band"),
            entry("aaa00000003", "rick astley topic"),
        ];
        let results = filter_by_artist(entries, "Rick Astley", 10);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.uploader.to_lowercase().contains("rick astley")));
    }

    #[test]
    fn artist_filter_respects_limit() {
        let entries = (0..20)
            .map(|i| entry(&format!("aaa{i:08}"), "Same Artist"))
            .collect();
        let results = filter_by_artist(entries, "same artist", 5);
        assert_eq!(results.len(), 5);
    }

    struct EmptyApi;

    impl ApiSearch for EmptyApi {
        fn search_videos(&self, _: &str, _: usize) -> Result<Vec<SearchResult>> {
            Ok(Vec::new())
        }

        fn search_by_artist(&self, _: &str, _: usize) -> Result<Vec<SearchResult>> {
            Ok(Vec::new())
        }
    }

    struct FailingApi;

    impl ApiSearch for FailingApi {
        fn search_videos(&self, _: &str, _: usize) -> Result<Vec<SearchResult>> {
            anyhow::bail!("quota exceeded")
        }

        fn search_by_artist(&self, _: &str, _: usize) -> Result<Vec<SearchResult>> {
            anyhow::bail!("quota exceeded")
        }
    }

    #[test]
    fn empty_api_channel_match_falls_back_to_filtered_extractor_results() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(
            dir.path(),
            r#"echo '{"entries": [
                {"id": "aaa00000001", "title": "Track", "uploader": "Obscure Artist"},
                {"id": "aaa00000002", "title": "Reaction", "uploader": "Reactor"}
            ]}'"#,
        );
        let _guard = set_ytdlp_stub_path(stub);

        let outcome =
            hybrid_search(Some(&EmptyApi), SearchMode::Artist, "obscure artist", 10).unwrap();
        assert_eq!(outcome.source, Provenance::Extractor);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].uploader, "Obscure Artist");
    }

    #[test]
    fn empty_api_and_empty_fallback_keep_api_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(dir.path(), r#"echo '{"entries": []}'"#);
        let _guard = set_ytdlp_stub_path(stub);

        let outcome = hybrid_search(Some(&EmptyApi), SearchMode::Video, "nothing here", 5).unwrap();
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.source, Provenance::OfficialApi);
    }

    #[test]
    fn failing_api_falls_back_to_extractor() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(
            dir.path(),
            r#"echo '{"entries": [{"id": "aaa00000001", "title": "One"}]}'"#,
        );
        let _guard = set_ytdlp_stub_path(stub);

        let outcome = hybrid_search(Some(&FailingApi), SearchMode::Video, "q", 5).unwrap();
        assert_eq!(outcome.source, Provenance::Extractor);
        assert_eq!(outcome.results.len(), 1);
    }

    #[test]
    fn no_api_key_goes_straight_to_extractor() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(
            dir.path(),
            r#"echo '{"entries": [
                {"id": "aaa00000001", "title": "Hit", "uploader": "The Artist"},
                {"id": "aaa00000002", "title": "Cover", "uploader": "Somebody Else"}
            ]}'"#,
        );
        let _guard = set_ytdlp_stub_path(stub);

        let outcome = hybrid_search(None, SearchMode::Artist, "the artist", 10).unwrap();
        assert_eq!(outcome.source, Provenance::Extractor);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].uploader, "The Artist");
    }

    #[test]
    fn video_mode_maps_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(
            dir.path(),
            r#"echo '{"entries": [
                {"id": "aaa00000001", "title": "One"},
                {"id": "aaa00000002", "title": "Two"},
                {"title": "no id, dropped"}
            ]}'"#,
        );
        let _guard = set_ytdlp_stub_path(stub);

        let outcome = hybrid_search(None, SearchMode::Video, "query", 10).unwrap();
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.source, Provenance::Extractor);
    }
}
