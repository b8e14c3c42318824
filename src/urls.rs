#![forbid(unsafe_code)]

//! URL allow-listing, normalization, and video-id extraction.
//!
//! Validation happens before any network call: only YouTube-family and
//! TikTok-family hosts are accepted, matched at the start of the string.

use once_cell::sync::Lazy;
use regex::Regex;

static YOUTUBE_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?://)?(www\.)?(youtube|youtu|youtube-nocookie)\.(com|be)/").unwrap()
});

static TIKTOK_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(https?://)?(www\.|vm\.)?tiktok\.com/").unwrap());

/// Ordered id patterns; the first capture wins. The broad `v=`/path pattern
/// comes first on purpose, mirroring how ids are matched everywhere else in
/// the YouTube tooling ecosystem.
static VIDEO_ID_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?:v=|/)([0-9A-Za-z_-]{11})",
        r"(?:embed/)([0-9A-Za-z_-]{11})",
        r"(?:watch\?v=)([0-9A-Za-z_-]{11})",
        r"youtu\.be/([0-9A-Za-z_-]{11})",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

static UNSAFE_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[\\/:*?"<>|]+"#).unwrap());

/// Returns true only for allow-listed YouTube/TikTok URLs.
pub fn is_valid_url(url: &str) -> bool {
    YOUTUBE_HOST.is_match(url) || TIKTOK_HOST.is_match(url)
}

pub fn is_youtube_url(url: &str) -> bool {
    url.contains("youtube.com") || url.contains("youtu.be") || url.contains("youtube-nocookie.com")
}

/// Strips every query parameter except the video id (`v`) and timestamp
/// (`t`) from YouTube URLs so yt-dlp never sees a playlist/tab context.
/// Non-YouTube URLs and anything that fails to parse pass through unchanged.
pub fn normalize_url(url: &str) -> String {
    if !is_youtube_url(url) {
        return url.to_string();
    }

    let Some((base, rest)) = split_query(url) else {
        return url.to_string();
    };

    let (query, fragment) = match rest.split_once('#') {
        Some((query, fragment)) => (query, Some(fragment)),
        None => (rest, None),
    };

    let mut kept: Vec<(String, String)> = Vec::new();
    for pair in query.split('&') {
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (key, value),
            None => (pair, ""),
        };
        if key == "v" || key == "t" {
            kept.push((key.to_string(), value.to_string()));
        }
    }

    // youtu.be carries the id in its path, so only the timestamp survives.
    if base.contains("youtu.be") {
        kept.retain(|(key, _)| key == "t");
    }

    let mut normalized = base.to_string();
    if !kept.is_empty() {
        let query: Vec<String> = kept
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        normalized.push('?');
        normalized.push_str(&query.join("&"));
    }
    if let Some(fragment) = fragment {
        normalized.push('#');
        normalized.push_str(fragment);
    }
    normalized
}

fn split_query(url: &str) -> Option<(&str, &str)> {
    url.split_once('?')
}

/// Extracts an 11-character YouTube video id, trying each pattern in order.
pub fn extract_youtube_id(url: &str) -> Option<String> {
    for pattern in VIDEO_ID_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(url) {
            return Some(captures[1].to_string());
        }
    }
    None
}

/// Rewrites a video title into a filesystem-safe filename stem. Never
/// returns an empty string.
pub fn slugify_title(title: &str) -> String {
    let replaced = UNSAFE_FILENAME_CHARS.replace_all(title.trim(), "_");
    let trimmed = replaced.trim_matches(['_', '.', ' ']);
    if trimmed.is_empty() {
        "video".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_youtube_family_hosts() {
        assert!(is_valid_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(is_valid_url("http://youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(is_valid_url("youtu.be/dQw4w9WgXcQ"));
        assert!(is_valid_url("https://www.youtube-nocookie.com/embed/dQw4w9WgXcQ"));
    }

    #[test]
    fn accepts_tiktok_family_hosts() {
        assert!(is_valid_url("https://www.tiktok.com/@user/video/123"));
        assert!(is_valid_url("https://vm.tiktok.com/ZMabcdef/"));
        assert!(is_valid_url("tiktok.com/@user/video/123"));
    }

    #[test]
    fn rejects_everything_else() {
        assert!(!is_valid_url("https://vimeo.com/12345"));
        assert!(!is_valid_url("https://evil.example/youtube.com/watch?v=x"));
        assert!(!is_valid_url("file:///etc/passwd"));
        assert!(!is_valid_url(""));
        assert!(!is_valid_url("not a url"));
    }

    #[test]
    fn normalize_strips_playlist_params() {
        let url = "https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=PLx&index=3&t=42";
        assert_eq!(
            normalize_url(url),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42"
        );
    }

    #[test]
    fn normalize_keeps_short_urls_and_timestamps() {
        assert_eq!(
            normalize_url("https://youtu.be/dQw4w9WgXcQ?si=tracking&t=10"),
            "https://youtu.be/dQw4w9WgXcQ?t=10"
        );
        assert_eq!(
            normalize_url("https://youtu.be/dQw4w9WgXcQ?si=tracking"),
            "https://youtu.be/dQw4w9WgXcQ"
        );
    }

    #[test]
    fn normalize_passes_non_youtube_through() {
        let url = "https://www.tiktok.com/@user/video/123?lang=en";
        assert_eq!(normalize_url(url), url);
    }

    #[test]
    fn normalize_is_best_effort() {
        assert_eq!(normalize_url(""), "");
        assert_eq!(
            normalize_url("https://www.youtube.com/watch"),
            "https://www.youtube.com/watch"
        );
    }

    #[test]
    fn extracts_ids_from_common_forms() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
            "https://www.youtube.com/v/dQw4w9WgXcQ?version=3",
        ] {
            assert_eq!(extract_youtube_id(url).as_deref(), Some("dQw4w9WgXcQ"));
        }
        assert!(extract_youtube_id("https://www.youtube.com/").is_none());
    }

    #[test]
    fn slugify_removes_unsafe_characters() {
        assert_eq!(
            slugify_title(r#"What: is this? "A <test>" |video|"#),
            "What_ is this_ _A _test_ _video"
        );
        assert_eq!(slugify_title("plain title"), "plain title");
    }

    #[test]
    fn slugify_never_returns_empty() {
        assert_eq!(slugify_title(""), "video");
        assert_eq!(slugify_title("???"), "video");
        assert_eq!(slugify_title("..."), "video");
    }
}
