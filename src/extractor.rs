#![forbid(unsafe_code)]

//! yt-dlp subprocess layer: metadata extraction with an ordered fallback
//! chain of configuration presets, plus `ytsearch` queries.
//!
//! The presets are tunable heuristics against a moving target, not protocol.
//! Only the chain shape is contract: try in order, first success wins,
//! exhaustion is terminal. Expect the values to need refreshing whenever the
//! platforms rotate their bot defenses.

#[cfg(test)]
use std::path::PathBuf;
use std::process::Command;
#[cfg(test)]
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, bail};

use crate::config::CookieConfig;
use crate::metadata::{ExtractedInfo, SearchEntry};

const SOCKET_TIMEOUT_SECS: &str = "30";
const RETRIES: &str = "3";

const DESKTOP_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const TV_UA: &str = "Mozilla/5.0 (CrKey armv7l 1.36.159268) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.6099.0 Safari/537.36 CrKey/1.36.159268";
const YOUTUBE_REFERER: &str = "https://www.youtube.com/";

/// Browser-shaped header set sent with the standard preset.
const BROWSER_HEADERS: &[(&str, &str)] = &[
    ("Accept", "*/*"),
    ("Accept-Language", "en-US,en;q=0.9"),
    ("DNT", "1"),
    ("Sec-Fetch-Mode", "navigate"),
];

#[cfg(test)]
static YT_DLP_STUB: Mutex<Option<PathBuf>> = Mutex::new(None);
#[cfg(test)]
static STUB_USE_LOCK: Mutex<()> = Mutex::new(());

pub(crate) fn yt_dlp_command() -> Command {
    #[cfg(test)]
    {
        if let Some(path) = YT_DLP_STUB.lock().unwrap().clone() {
            return Command::new(path);
        }
    }
    Command::new("yt-dlp")
}

#[cfg(test)]
pub(crate) fn set_ytdlp_stub_path(path: PathBuf) -> YtDlpStubGuard {
    let guard = STUB_USE_LOCK.lock().unwrap();
    {
        let mut lock = YT_DLP_STUB.lock().unwrap();
        *lock = Some(path);
    }
    YtDlpStubGuard { lock: Some(guard) }
}

#[cfg(test)]
pub(crate) struct YtDlpStubGuard {
    lock: Option<MutexGuard<'static, ()>>,
}

#[cfg(test)]
impl Drop for YtDlpStubGuard {
    fn drop(&mut self) {
        *YT_DLP_STUB.lock().unwrap() = None;
        self.lock.take();
    }
}

/// Fails loudly at startup when yt-dlp is missing from PATH.
pub fn ensure_ytdlp_available() -> Result<()> {
    let status = yt_dlp_command()
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .context("yt-dlp not found in PATH")?;
    if !status.success() {
        bail!("yt-dlp --version exited with {status}");
    }
    Ok(())
}

/// One named variant of the extraction knobs tried by the fallback chain.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionPreset {
    pub name: &'static str,
    /// yt-dlp `player_client` list, comma separated.
    pub player_clients: Option<&'static str>,
    /// Adaptive-stream protocols to skip.
    pub skip: Option<&'static str>,
    pub user_agent: Option<&'static str>,
    pub referer: Option<&'static str>,
    pub headers: &'static [(&'static str, &'static str)],
}

/// The chain, in attempt order. Count and ordering are deliberately not
/// stable across releases.
pub const PRESET_CHAIN: &[ExtractionPreset] = &[
    ExtractionPreset {
        name: "standard",
        player_clients: Some("android,web,ios,tv_embedded"),
        skip: Some("dash,hls"),
        user_agent: Some(DESKTOP_UA),
        referer: Some(YOUTUBE_REFERER),
        headers: BROWSER_HEADERS,
    },
    ExtractionPreset {
        name: "mobile",
        player_clients: Some("android,ios"),
        skip: Some("dash"),
        user_agent: Some(DESKTOP_UA),
        referer: Some(YOUTUBE_REFERER),
        headers: &[],
    },
    ExtractionPreset {
        name: "tv-embedded",
        player_clients: Some("tv_embedded"),
        skip: Some("dash"),
        user_agent: Some(TV_UA),
        referer: Some(YOUTUBE_REFERER),
        headers: &[],
    },
    ExtractionPreset {
        name: "basic",
        player_clients: None,
        skip: None,
        user_agent: None,
        referer: None,
        headers: &[],
    },
];

impl ExtractionPreset {
    /// Arguments for a metadata-only extraction of `url` under this preset.
    pub fn extract_args(&self, url: &str, cookies: &CookieConfig) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--dump-single-json".into(),
            "--skip-download".into(),
            "--no-warnings".into(),
            "--no-playlist".into(),
            "--socket-timeout".into(),
            SOCKET_TIMEOUT_SECS.into(),
            "--retries".into(),
            RETRIES.into(),
        ];
        self.push_client_args(&mut args);
        push_cookie_args(&mut args, cookies);
        args.push(url.to_string());
        args
    }

    /// The client-identity portion, shared with the download runner.
    pub fn push_client_args(&self, args: &mut Vec<String>) {
        if self.player_clients.is_some() || self.skip.is_some() {
            let mut extractor_args = String::from("youtube:");
            if let Some(clients) = self.player_clients {
                extractor_args.push_str(&format!("player_client={clients}"));
            }
            if let Some(skip) = self.skip {
                if self.player_clients.is_some() {
                    extractor_args.push(';');
                }
                extractor_args.push_str(&format!("skip={skip}"));
            }
            args.push("--extractor-args".into());
            args.push(extractor_args);
        }
        if let Some(user_agent) = self.user_agent {
            args.push("--user-agent".into());
            args.push(user_agent.to_string());
        }
        if let Some(referer) = self.referer {
            args.push("--referer".into());
            args.push(referer.to_string());
        }
        for (name, value) in self.headers {
            args.push("--add-header".into());
            args.push(format!("{name}:{value}"));
        }
    }
}

pub fn push_cookie_args(args: &mut Vec<String>, cookies: &CookieConfig) {
    if let Some(file) = &cookies.cookie_file {
        args.push("--cookies".into());
        args.push(file.to_string_lossy().into_owned());
    }
    if let Some(header) = &cookies.cookie_header {
        args.push("--add-header".into());
        args.push(format!("Cookie:{header}"));
    }
}

/// Tries every preset in order and returns the first successful extraction.
/// Each failure logs a warning and advances; running out of presets is a
/// terminal error carrying the last failure.
pub fn extract_with_fallback(url: &str, cookies: &CookieConfig) -> Result<ExtractedInfo> {
    let mut last_error: Option<anyhow::Error> = None;
    for preset in PRESET_CHAIN {
        tracing::info!(preset = preset.name, url, "attempting extraction");
        match run_extract(preset, url, cookies) {
            Ok(info) => {
                tracing::info!(preset = preset.name, "extraction succeeded");
                return Ok(info);
            }
            Err(err) => {
                tracing::warn!(preset = preset.name, "extraction failed: {err:#}");
                last_error = Some(err);
            }
        }
    }
    match last_error {
        Some(err) => Err(err.context("could not extract video info with any preset")),
        None => bail!("no extraction presets configured"),
    }
}

fn run_extract(
    preset: &ExtractionPreset,
    url: &str,
    cookies: &CookieConfig,
) -> Result<ExtractedInfo> {
    let output = yt_dlp_command()
        .args(preset.extract_args(url, cookies))
        .output()
        .with_context(|| format!("spawning yt-dlp for {url}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "yt-dlp exited with {} ({})",
            output.status,
            stderr.trim().lines().last().unwrap_or("no stderr")
        );
    }
    serde_json::from_slice(&output.stdout).context("deserializing yt-dlp metadata JSON")
}

/// Runs a `ytsearchN:` query and returns the flat entry list. Used as the
/// search fallback when the official API is unavailable.
pub fn search(query: &str, max_results: usize) -> Result<Vec<SearchEntry>> {
    let target = format!("ytsearch{max_results}:{query}");
    let output = yt_dlp_command()
        .arg("--dump-single-json")
        .arg("--flat-playlist")
        .arg("--no-warnings")
        .arg("--skip-download")
        .arg(&target)
        .output()
        .with_context(|| format!("spawning yt-dlp for {target}"))?;
    if !output.status.success() {
        bail!("yt-dlp search exited with {}", output.status);
    }
    let info: ExtractedInfo =
        serde_json::from_slice(&output.stdout).context("deserializing yt-dlp search JSON")?;
    Ok(info.entries.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("yt-dlp-stub.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn standard_preset_args_carry_clients_and_cookies() {
        let cookies = CookieConfig {
            cookie_file: Some(PathBuf::from("/tmp/c.txt")),
            cookie_header: Some("a=b".into()),
        };
        let args = PRESET_CHAIN[0].extract_args("https://youtu.be/x", &cookies);
        assert!(args.contains(&"--dump-single-json".to_string()));
        assert!(args.contains(&"--no-playlist".to_string()));
        assert!(
            args.contains(&"youtube:player_client=android,web,ios,tv_embedded;skip=dash,hls".to_string())
        );
        assert!(args.contains(&"--cookies".to_string()));
        assert!(args.contains(&"Cookie:a=b".to_string()));
        assert_eq!(args.last().unwrap(), "https://youtu.be/x");
    }

    #[test]
    fn header_args_use_the_repeatable_singular_flag() {
        // yt-dlp only knows `--add-header`; the plural form is rejected as an
        // unknown option and would sink every preset that sets headers.
        let cookies = CookieConfig {
            cookie_file: None,
            cookie_header: Some("SID=abc".into()),
        };
        let args = PRESET_CHAIN[0].extract_args("https://youtu.be/x", &cookies);
        assert!(args.contains(&"--add-header".to_string()));
        assert!(!args.iter().any(|arg| arg == "--add-headers"));

        let mut cookie_args = Vec::new();
        push_cookie_args(&mut cookie_args, &cookies);
        assert_eq!(cookie_args, vec!["--add-header", "Cookie:SID=abc"]);
    }

    #[test]
    fn basic_preset_has_no_client_knobs() {
        let args = PRESET_CHAIN
            .last()
            .unwrap()
            .extract_args("https://youtu.be/x", &CookieConfig::default());
        assert!(!args.iter().any(|arg| arg == "--extractor-args"));
        assert!(!args.iter().any(|arg| arg == "--user-agent"));
        assert!(!args.iter().any(|arg| arg == "--cookies"));
    }

    #[test]
    fn fallback_returns_first_successful_preset() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(
            dir.path(),
            r#"echo '{"title": "Stubbed", "duration": 12}'"#,
        );
        let _guard = set_ytdlp_stub_path(stub);

        let info = extract_with_fallback("https://youtu.be/x", &CookieConfig::default()).unwrap();
        assert_eq!(info.title_or_default(), "Stubbed");
        assert_eq!(info.duration_seconds(), 12);
    }

    #[test]
    fn fallback_advances_past_failing_presets() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("attempts");
        let stub = write_stub(
            dir.path(),
            &format!(
                r#"count=$(cat {marker} 2>/dev/null || echo 0)
echo $((count + 1)) > {marker}
if [ "$count" -lt 2 ]; then
  echo "ERROR: Sign in to confirm you are not a bot" >&2
  exit 1
fi
echo '{{"title": "Third time lucky"}}'"#,
                marker = marker.display()
            ),
        );
        let _guard = set_ytdlp_stub_path(stub);

        let info = extract_with_fallback("https://youtu.be/x", &CookieConfig::default()).unwrap();
        assert_eq!(info.title_or_default(), "Third time lucky");
        assert_eq!(fs::read_to_string(&marker).unwrap().trim(), "3");
    }

    #[test]
    fn exhausting_the_chain_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(dir.path(), "echo 'HTTP Error 429' >&2\nexit 1");
        let _guard = set_ytdlp_stub_path(stub);

        let err =
            extract_with_fallback("https://youtu.be/x", &CookieConfig::default()).unwrap_err();
        assert!(err.to_string().contains("any preset"));
    }

    #[test]
    fn search_parses_flat_entries() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(
            dir.path(),
            r#"echo '{"entries": [{"id": "abc12345678", "title": "Hit", "channel": "Artist"}]}'"#,
        );
        let _guard = set_ytdlp_stub_path(stub);

        let entries = search("some song", 5).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title.as_deref(), Some("Hit"));
        assert_eq!(entries[0].uploader_name(), "Artist");
    }
}
