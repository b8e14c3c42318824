#![forbid(unsafe_code)]

//! Runtime configuration resolved from the process environment and an
//! optional `.env` file. Process env always wins over file values.

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_MAX_BODY_BYTES: usize = 52_428_800;
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const DEV_SECRET_KEY: &str = "dev-key-change-in-production";

/// Sentinel value shipped in example env files; treated the same as no key.
const API_KEY_PLACEHOLDER: &str = "your_youtube_api_key_here";

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub secret_key: String,
    pub max_body_bytes: usize,
    pub log_level: String,
    pub cors_origins: CorsOrigins,
    pub youtube_api_key: Option<String>,
    pub download_dir: PathBuf,
    pub web_root: Option<PathBuf>,
    pub cookies: CookieConfig,
}

/// `*` allows every origin; otherwise an explicit comma-separated list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsOrigins {
    Any,
    List(Vec<String>),
}

/// Cookie material handed to yt-dlp to get past rate limits and bot checks.
///
/// A Netscape cookie file takes precedence over a base64 blob; a raw
/// `Cookie:` header string is independent and may be set alongside either.
#[derive(Debug, Clone, Default)]
pub struct CookieConfig {
    pub cookie_file: Option<PathBuf>,
    pub cookie_header: Option<String>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_ENV_PATH))
    }

    pub fn load_from(env_path: &Path) -> Result<Self> {
        let file_vars = read_env_file(env_path)?;
        Ok(Self::build(&file_vars, env_var_string))
    }

    fn build(
        file_vars: &HashMap<String, String>,
        env_lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

        let host = lookup("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = lookup("PORT")
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let debug = lookup("DEBUG")
            .map(|value| value.eq_ignore_ascii_case("true") || value == "1")
            .unwrap_or(false);
        let secret_key = lookup("SECRET_KEY").unwrap_or_else(|| DEV_SECRET_KEY.to_string());
        let max_body_bytes = lookup("MAX_FILE_SIZE")
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_BODY_BYTES);
        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let cors_origins = parse_cors_origins(lookup("CORS_ORIGINS").as_deref());
        let youtube_api_key = lookup("YOUTUBE_API_KEY").filter(|key| key != API_KEY_PLACEHOLDER);
        let download_dir = lookup("DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR));
        let web_root = lookup("WEB_ROOT").map(PathBuf::from);

        let cookies = resolve_cookies(
            lookup("YT_COOKIES_FILE").as_deref(),
            lookup("YT_COOKIES_B64").as_deref(),
            lookup("YT_COOKIES_HEADER"),
        );

        Self {
            host,
            port,
            debug,
            secret_key,
            max_body_bytes,
            log_level,
            cors_origins,
            youtube_api_key,
            download_dir,
            web_root,
            cookies,
        }
    }

    pub fn secret_key_is_dev_default(&self) -> bool {
        self.secret_key == DEV_SECRET_KEY
    }
}

fn parse_cors_origins(value: Option<&str>) -> CorsOrigins {
    match value {
        None | Some("*") => CorsOrigins::Any,
        Some(raw) => {
            let origins: Vec<String> = raw
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect();
            if origins.is_empty() {
                CorsOrigins::Any
            } else {
                CorsOrigins::List(origins)
            }
        }
    }
}

/// Materializes cookie configuration. A broken cookie setup is reported and
/// ignored rather than aborting startup; cookies have always been a
/// best-effort knob here.
fn resolve_cookies(
    file: Option<&str>,
    blob_b64: Option<&str>,
    header: Option<String>,
) -> CookieConfig {
    let cookie_file = match (file, blob_b64) {
        (Some(path), _) if Path::new(path).exists() => Some(PathBuf::from(path)),
        (_, Some(blob)) => match write_cookie_blob(blob) {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::warn!("could not prepare cookie file from YT_COOKIES_B64: {err:#}");
                None
            }
        },
        (Some(path), None) => {
            tracing::warn!("YT_COOKIES_FILE {path} does not exist; ignoring");
            None
        }
        (None, None) => None,
    };

    CookieConfig {
        cookie_file,
        cookie_header: header,
    }
}

fn write_cookie_blob(blob_b64: &str) -> Result<PathBuf> {
    let raw = BASE64
        .decode(blob_b64.trim().as_bytes())
        .context("decoding YT_COOKIES_B64")?;
    let path = env::temp_dir().join("vidbridge_cookies.txt");
    fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_env(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> Settings {
        let env = make_env(contents);
        let vars = read_env_file(env.path()).unwrap();
        Settings::build(&vars, |_| None)
    }

    #[test]
    fn defaults_when_file_is_empty() {
        let settings = settings_from("");
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.port, DEFAULT_PORT);
        assert!(!settings.debug);
        assert_eq!(settings.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
        assert_eq!(settings.cors_origins, CorsOrigins::Any);
        assert!(settings.youtube_api_key.is_none());
        assert_eq!(settings.download_dir, PathBuf::from(DEFAULT_DOWNLOAD_DIR));
        assert!(settings.secret_key_is_dev_default());
    }

    #[test]
    fn reads_host_port_and_debug() {
        let settings = settings_from("HOST=\"127.0.0.1\"\nPORT=\"8080\"\nDEBUG=true\n");
        assert_eq!(settings.host, "127.0.0.1");
        assert_eq!(settings.port, 8080);
        assert!(settings.debug);
    }

    #[test]
    fn invalid_port_falls_back_to_default() {
        let settings = settings_from("PORT=nope\n");
        assert_eq!(settings.port, DEFAULT_PORT);
    }

    #[test]
    fn placeholder_api_key_counts_as_unset() {
        let settings = settings_from("YOUTUBE_API_KEY=your_youtube_api_key_here\n");
        assert!(settings.youtube_api_key.is_none());

        let settings = settings_from("YOUTUBE_API_KEY=AIzaRealKey\n");
        assert_eq!(settings.youtube_api_key.as_deref(), Some("AIzaRealKey"));
    }

    #[test]
    fn cors_origins_star_and_list() {
        assert_eq!(parse_cors_origins(Some("*")), CorsOrigins::Any);
        assert_eq!(parse_cors_origins(None), CorsOrigins::Any);
        assert_eq!(
            parse_cors_origins(Some("https://a.example, https://b.example")),
            CorsOrigins::List(vec![
                "https://a.example".to_string(),
                "https://b.example".to_string()
            ])
        );
    }

    #[test]
    fn env_wins_over_file() {
        let env = make_env("PORT=\"7000\"\n");
        let vars = read_env_file(env.path()).unwrap();
        let settings = Settings::build(&vars, |key| {
            if key == "PORT" {
                Some("9000".to_string())
            } else {
                None
            }
        });
        assert_eq!(settings.port, 9000);
    }

    #[test]
    fn env_file_handles_export_and_quotes() {
        let env = make_env(
            r#"
            export HOST="10.0.0.1"
            DOWNLOAD_DIR='/srv/dl'
            LOG_LEVEL =  "debug"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(env.path()).unwrap();
        assert_eq!(vars.get("HOST").unwrap(), "10.0.0.1");
        assert_eq!(vars.get("DOWNLOAD_DIR").unwrap(), "/srv/dl");
        assert_eq!(vars.get("LOG_LEVEL").unwrap(), "debug");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn missing_env_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn cookie_file_wins_over_blob() {
        let file = make_env("# netscape cookies\n");
        let path = file.path().to_string_lossy().into_owned();
        let cookies = resolve_cookies(Some(&path), Some("aWdub3JlZA=="), None);
        assert_eq!(cookies.cookie_file.as_deref(), Some(file.path()));
    }

    #[test]
    fn cookie_blob_is_materialized() {
        let cookies = resolve_cookies(None, Some("Y29va2llLWRhdGE="), Some("a=b; c=d".into()));
        let path = cookies.cookie_file.expect("blob should produce a file");
        assert_eq!(fs::read_to_string(&path).unwrap(), "cookie-data");
        assert_eq!(cookies.cookie_header.as_deref(), Some("a=b; c=d"));
    }
}
