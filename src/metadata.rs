//! Domain types shared between the extraction layer, the official API
//! client, and the HTTP surface.
//!
//! Nothing here is persisted; these structs shape the JSON responses and
//! mirror the subset of yt-dlp's `--dump-single-json` payload we read.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Marks where metadata came from so clients can judge its fidelity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Provenance {
    #[serde(rename = "youtube_api")]
    OfficialApi,
    #[serde(rename = "yt_dlp")]
    Extractor,
}

/// Client-facing metadata for a single video.
#[derive(Debug, Clone, Serialize)]
pub struct VideoMetadata {
    pub title: String,
    pub duration: i64,
    pub uploader: String,
    pub thumbnail: String,
    pub formats: Vec<FormatOption>,
    pub source: Provenance,
}

/// A display-oriented format row in the `/api/video-info` response.
#[derive(Debug, Clone, Serialize)]
pub struct FormatOption {
    pub format_id: String,
    pub ext: String,
    pub quality: String,
    pub filesize: i64,
}

impl FormatOption {
    fn preset(format_id: &str, ext: &str, quality: &str) -> Self {
        Self {
            format_id: format_id.to_string(),
            ext: ext.to_string(),
            quality: quality.to_string(),
            filesize: 0,
        }
    }
}

/// The fixed presets every response carries regardless of provenance.
pub fn basic_format_options() -> Vec<FormatOption> {
    vec![
        FormatOption::preset("best", "mp4", "Best available quality"),
        FormatOption::preset("worst", "mp4", "Lowest quality"),
        FormatOption::preset("bestaudio", "mp3", "Audio only (MP3)"),
    ]
}

/// Placeholder rows added when metadata came from the official API, which
/// never exposes per-format technical data.
pub fn api_format_options() -> Vec<FormatOption> {
    vec![
        FormatOption::preset("720", "mp4", "720p HD"),
        FormatOption::preset("480", "mp4", "480p SD"),
    ]
}

/// Real video formats seen by the extractor, appended after the presets:
/// capped at 1080p, deduplicated by height, at most three rows.
pub fn extractor_format_options(candidates: &[FormatCandidate]) -> Vec<FormatOption> {
    let mut seen = HashSet::new();
    let mut extra = Vec::new();
    for candidate in candidates {
        if !candidate.has_video() {
            continue;
        }
        let Some(height) = candidate.height else {
            continue;
        };
        if height > 1080 || !seen.insert(height) {
            continue;
        }
        extra.push(FormatOption {
            format_id: candidate.format_id.clone().unwrap_or_default(),
            ext: candidate.ext.clone().unwrap_or_else(|| "mp4".to_string()),
            quality: format!("{height}p"),
            filesize: candidate.filesize.unwrap_or(0),
        });
        if extra.len() == 3 {
            break;
        }
    }
    extra
}

/// One search hit, shaped identically for both search backends.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub uploader: String,
    pub duration: i64,
    pub thumbnail: String,
    pub video_id: String,
    pub video_url: String,
    pub platform: String,
}

/// `yt-dlp --dump-single-json` payload. Only the fields we read are listed
/// and everything is optional because older or regional videos routinely
/// lack metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractedInfo {
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub thumbnail: Option<String>,
    pub view_count: Option<i64>,
    pub description: Option<String>,
    #[serde(default)]
    pub formats: Option<Vec<FormatCandidate>>,
    /// Present when the extractor already resolved a single direct URL.
    pub url: Option<String>,
    pub ext: Option<String>,
    pub format_id: Option<String>,
    pub height: Option<i64>,
    pub acodec: Option<String>,
    pub vcodec: Option<String>,
    /// Search queries return a playlist-shaped payload with entries.
    #[serde(default)]
    pub entries: Option<Vec<SearchEntry>>,
}

impl ExtractedInfo {
    pub fn title_or_default(&self) -> &str {
        self.title.as_deref().filter(|t| !t.is_empty()).unwrap_or("video")
    }

    pub fn uploader_or_default(&self) -> &str {
        self.uploader
            .as_deref()
            .or(self.channel.as_deref())
            .filter(|u| !u.is_empty())
            .unwrap_or("Unknown")
    }

    pub fn duration_seconds(&self) -> i64 {
        self.duration.map(|d| d as i64).unwrap_or(0)
    }
}

/// One format record from the extractor. `acodec`/`vcodec` use the string
/// `"none"` for absent tracks, so the helpers below exist to keep that quirk
/// in one place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatCandidate {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub height: Option<i64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    /// Audio bitrate in kbit/s.
    pub abr: Option<f64>,
    /// Total bitrate in kbit/s.
    pub tbr: Option<f64>,
    pub filesize: Option<i64>,
    pub url: Option<String>,
    pub format_note: Option<String>,
}

impl FormatCandidate {
    pub fn has_video(&self) -> bool {
        matches!(self.vcodec.as_deref(), Some(codec) if codec != "none")
    }

    pub fn has_audio(&self) -> bool {
        matches!(self.acodec.as_deref(), Some(codec) if codec != "none")
    }

    /// Audio and video multiplexed together; downloadable as one file.
    pub fn is_progressive(&self) -> bool {
        self.has_video() && self.has_audio()
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio() && !self.has_video()
    }

    pub fn height_or_zero(&self) -> i64 {
        self.height.unwrap_or(0)
    }
}

/// Flat entry from a `ytsearchN:` playlist response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub webpage_url: Option<String>,
    pub view_count: Option<i64>,
}

impl SearchEntry {
    pub fn uploader_name(&self) -> &str {
        self.uploader
            .as_deref()
            .or(self.channel.as_deref())
            .unwrap_or("")
    }

    pub fn into_search_result(self) -> Option<SearchResult> {
        let video_id = self.id.clone()?;
        let video_url = self
            .webpage_url
            .clone()
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={video_id}"));
        Some(SearchResult {
            title: self.title.clone().unwrap_or_default(),
            uploader: self.uploader_name().to_string(),
            duration: self.duration.map(|d| d as i64).unwrap_or(0),
            thumbnail: self.thumbnail.clone().unwrap_or_default(),
            video_id,
            video_url,
            platform: "youtube".to_string(),
        })
    }
}
