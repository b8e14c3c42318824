#![forbid(unsafe_code)]

//! Official YouTube Data API v3 client. Blocking on purpose (`ureq`), so
//! callers run it inside `spawn_blocking`.
//!
//! The API never returns per-format technical data; callers synthesize a
//! preset format list for API-sourced metadata.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::metadata::SearchResult;

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const CHANNEL_MATCH_LIMIT: usize = 3;

static ISO8601_DURATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^PT(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?").unwrap());

/// Converts an ISO-8601 duration (`PT4M13S`, any component optional) to total
/// seconds. Unparsable input yields 0.
pub fn parse_iso8601_duration(value: &str) -> i64 {
    let Some(captures) = ISO8601_DURATION.captures(value) else {
        return 0;
    };
    let component = |index: usize| {
        captures
            .get(index)
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .unwrap_or(0)
    };
    component(1) * 3600 + component(2) * 60 + component(3)
}

/// Snippet-level metadata for a single video, as returned by `videos.list`.
#[derive(Debug, Clone)]
pub struct ApiVideoInfo {
    pub title: String,
    pub duration: i64,
    pub uploader: String,
    pub thumbnail: String,
    pub description: String,
    pub view_count: i64,
}

pub struct YoutubeApiClient {
    key: String,
    agent: ureq::Agent,
}

impl YoutubeApiClient {
    pub fn new(key: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(15))
            .build();
        Self {
            key: key.into(),
            agent,
        }
    }

    /// Looks up one video. `Ok(None)` means the API answered but found
    /// nothing; callers fall back to the extraction chain either way.
    pub fn video_info(&self, video_id: &str) -> Result<Option<ApiVideoInfo>> {
        let response: VideoListResponse = self
            .get(
                "videos",
                &[("part", "snippet,contentDetails,statistics"), ("id", video_id)],
            )
            .context("querying videos.list")?;
        Ok(map_video_info(response))
    }

    /// Free-text video search with full details for every hit.
    pub fn search_videos(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let max = max_results.to_string();
        let response: SearchListResponse = self
            .get(
                "search",
                &[
                    ("part", "snippet"),
                    ("type", "video"),
                    ("q", query),
                    ("maxResults", &max),
                ],
            )
            .context("querying search.list")?;

        let video_ids: Vec<String> = response
            .items
            .into_iter()
            .filter_map(|item| item.id.video_id)
            .collect();
        if video_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.video_details(&video_ids)
    }

    /// Channel-scoped search: match up to three channels by name, pull each
    /// one's most relevant videos, then sort the union by view count.
    pub fn search_by_artist(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let channels: SearchListResponse = self
            .get(
                "search",
                &[
                    ("part", "snippet"),
                    ("type", "channel"),
                    ("q", query),
                    ("maxResults", &CHANNEL_MATCH_LIMIT.to_string()),
                ],
            )
            .context("querying channel search")?;

        let channel_ids: Vec<String> = channels
            .items
            .into_iter()
            .filter_map(|item| item.id.channel_id)
            .collect();
        if channel_ids.is_empty() {
            return Ok(Vec::new());
        }

        let per_channel = max_results.min(10).to_string();
        let mut video_ids: Vec<String> = Vec::new();
        for channel_id in &channel_ids {
            let videos: SearchListResponse = self
                .get(
                    "search",
                    &[
                        ("part", "snippet"),
                        ("type", "video"),
                        ("channelId", channel_id),
                        ("order", "relevance"),
                        ("maxResults", &per_channel),
                    ],
                )
                .context("querying channel videos")?;
            video_ids.extend(videos.items.into_iter().filter_map(|item| item.id.video_id));
            if video_ids.len() >= max_results {
                break;
            }
        }
        video_ids.truncate(max_results);
        if video_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut with_views = self.video_details_with_views(&video_ids)?;
        with_views.sort_by_key(|(_, views)| std::cmp::Reverse(*views));
        Ok(with_views.into_iter().map(|(result, _)| result).collect())
    }

    fn video_details(&self, video_ids: &[String]) -> Result<Vec<SearchResult>> {
        Ok(self
            .video_details_with_views(video_ids)?
            .into_iter()
            .map(|(result, _)| result)
            .collect())
    }

    fn video_details_with_views(
        &self,
        video_ids: &[String],
    ) -> Result<Vec<(SearchResult, i64)>> {
        let ids = video_ids.join(",");
        let response: VideoListResponse = self
            .get(
                "videos",
                &[("part", "snippet,contentDetails,statistics"), ("id", &ids)],
            )
            .context("querying video details")?;
        Ok(map_search_results(response))
    }

    fn get<T: serde::de::DeserializeOwned>(
        &self,
        resource: &str,
        params: &[(&str, &str)],
    ) -> Result<T> {
        let mut request = self
            .agent
            .get(&format!("{API_BASE}/{resource}"))
            .query("key", &self.key);
        for (name, value) in params {
            request = request.query(name, value);
        }
        let response = request.call().context("calling YouTube API")?;
        if response.status() != 200 {
            bail!("YouTube API returned status {}", response.status());
        }
        response.into_json().context("decoding YouTube API response")
    }
}

fn map_video_info(response: VideoListResponse) -> Option<ApiVideoInfo> {
    let item = response.items.into_iter().next()?;
    let snippet = item.snippet?;
    let duration = item
        .content_details
        .map(|details| parse_iso8601_duration(&details.duration))
        .unwrap_or(0);
    let view_count = item
        .statistics
        .and_then(|stats| stats.view_count)
        .and_then(|count| count.parse().ok())
        .unwrap_or(0);
    Some(ApiVideoInfo {
        title: snippet.title.clone().unwrap_or_default(),
        duration,
        uploader: snippet.channel_title.clone().unwrap_or_default(),
        thumbnail: snippet.best_thumbnail(),
        description: snippet.description.unwrap_or_default(),
        view_count,
    })
}

fn map_search_results(response: VideoListResponse) -> Vec<(SearchResult, i64)> {
    response
        .items
        .into_iter()
        .filter_map(|item| {
            let video_id = item.id?;
            let snippet = item.snippet?;
            let duration = item
                .content_details
                .map(|details| parse_iso8601_duration(&details.duration))
                .unwrap_or(0);
            let views = item
                .statistics
                .and_then(|stats| stats.view_count)
                .and_then(|count| count.parse().ok())
                .unwrap_or(0);
            let result = SearchResult {
                title: snippet.title.clone().unwrap_or_default(),
                uploader: snippet.channel_title.clone().unwrap_or_default(),
                duration,
                thumbnail: snippet.listing_thumbnail(),
                video_url: format!("https://www.youtube.com/watch?v={video_id}"),
                video_id,
                platform: "youtube".to_string(),
            };
            Some((result, views))
        })
        .collect()
}

// --- wire types -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    id: Option<String>,
    snippet: Option<Snippet>,
    #[serde(rename = "contentDetails")]
    content_details: Option<ContentDetails>,
    statistics: Option<Statistics>,
}

#[derive(Debug, Deserialize)]
struct Snippet {
    title: Option<String>,
    #[serde(rename = "channelTitle")]
    channel_title: Option<String>,
    description: Option<String>,
    #[serde(default)]
    thumbnails: HashMap<String, Thumbnail>,
}

impl Snippet {
    /// Video-info responses prefer the largest thumbnail available.
    fn best_thumbnail(&self) -> String {
        for size in ["maxres", "high", "default"] {
            if let Some(thumb) = self.thumbnails.get(size) {
                return thumb.url.clone();
            }
        }
        String::new()
    }

    /// Search listings use the mid-size artwork.
    fn listing_thumbnail(&self) -> String {
        for size in ["high", "default"] {
            if let Some(thumb) = self.thumbnails.get(size) {
                return thumb.url.clone();
            }
        }
        String::new()
    }
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ContentDetails {
    #[serde(default)]
    duration: String,
}

#[derive(Debug, Deserialize)]
struct Statistics {
    #[serde(rename = "viewCount")]
    view_count: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchListResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
}

#[derive(Debug, Deserialize)]
struct SearchItemId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
    #[serde(rename = "channelId")]
    channel_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parsing_matches_known_values() {
        assert_eq!(parse_iso8601_duration("PT4M13S"), 253);
        assert_eq!(parse_iso8601_duration("PT1H"), 3600);
        assert_eq!(parse_iso8601_duration("PT1H2M3S"), 3723);
        assert_eq!(parse_iso8601_duration("PT0S"), 0);
        assert_eq!(parse_iso8601_duration("garbage"), 0);
        assert_eq!(parse_iso8601_duration(""), 0);
    }

    #[test]
    fn video_info_mapping_picks_maxres_thumbnail() {
        let response: VideoListResponse = serde_json::from_str(
            r#"{"items": [{
                "id": "abc12345678",
                "snippet": {
                    "title": "A Title",
                    "channelTitle": "A Channel",
                    "description": "desc",
                    "thumbnails": {
                        "default": {"url": "https://img/default.jpg"},
                        "high": {"url": "https://img/high.jpg"},
                        "maxres": {"url": "https://img/maxres.jpg"}
                    }
                },
                "contentDetails": {"duration": "PT2M"},
                "statistics": {"viewCount": "1234"}
            }]}"#,
        )
        .unwrap();
        let info = map_video_info(response).unwrap();
        assert_eq!(info.title, "A Title");
        assert_eq!(info.duration, 120);
        assert_eq!(info.thumbnail, "https://img/maxres.jpg");
        assert_eq!(info.view_count, 1234);
    }

    #[test]
    fn empty_items_maps_to_none() {
        let response: VideoListResponse = serde_json::from_str(r#"{"items": []}"#).unwrap();
        assert!(map_video_info(response).is_none());
    }

    #[test]
    fn search_results_build_canonical_urls() {
        let response: VideoListResponse = serde_json::from_str(
            r#"{"items": [{
                "id": "xyz98765432",
                "snippet": {
                    "title": "Hit",
                    "channelTitle": "Artist",
                    "thumbnails": {"high": {"url": "https://img/h.jpg"}}
                },
                "contentDetails": {"duration": "PT3M20S"}
            }]}"#,
        )
        .unwrap();
        let results = map_search_results(response);
        assert_eq!(results.len(), 1);
        let (result, views) = &results[0];
        assert_eq!(result.video_url, "https://www.youtube.com/watch?v=xyz98765432");
        assert_eq!(result.duration, 200);
        assert_eq!(result.thumbnail, "https://img/h.jpg");
        assert_eq!(*views, 0);
    }

    #[test]
    fn artist_details_keep_view_counts_for_sorting() {
        let response: VideoListResponse = serde_json::from_str(
            r#"{"items": [
                {"id": "aaa11111111", "snippet": {"title": "Low", "channelTitle": "Artist",
                 "thumbnails": {}}, "statistics": {"viewCount": "10"}},
                {"id": "bbb22222222", "snippet": {"title": "High", "channelTitle": "Artist",
                 "thumbnails": {}}, "statistics": {"viewCount": "9000"}}
            ]}"#,
        )
        .unwrap();
        let mut results = map_search_results(response);
        results.sort_by_key(|(_, views)| std::cmp::Reverse(*views));
        assert_eq!(results[0].0.title, "High");
        assert_eq!(results[0].1, 9000);
    }
}
