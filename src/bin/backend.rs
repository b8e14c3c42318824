#![forbid(unsafe_code)]

//! Axum backend bridging web clients to yt-dlp and the YouTube Data API.
//!
//! Every route speaks JSON; failures use a `{"error": ...}` envelope. The
//! blocking operations (extraction, official API calls) run through
//! `spawn_blocking`; downloads run as background jobs polled via
//! `/api/progress/{id}`.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Path as AxumPath, State},
    http::{HeaderValue, Request, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing_subscriber::EnvFilter;
use vidbridge::config::{CorsOrigins, DEFAULT_ENV_PATH, Settings};
use vidbridge::extractor::{self, ensure_ytdlp_available};
use vidbridge::formats::{default_ext, output_filename, pick_direct_format};
use vidbridge::jobs::{DOWNLOAD_DEADLINE, DownloadPlan, JobSnapshot, JobStore, spawn_download};
use vidbridge::metadata::{
    ExtractedInfo, Provenance, SearchResult, VideoMetadata, api_format_options,
    basic_format_options, extractor_format_options,
};
use vidbridge::search::{ApiSearch, SearchMode, hybrid_search};
use vidbridge::security::{ensure_not_root, is_safe_path_segment};
use vidbridge::urls::{extract_youtube_id, is_valid_url, is_youtube_url, normalize_url};
use vidbridge::youtube_api::{ApiVideoInfo, YoutubeApiClient};

const DEFAULT_MAX_SEARCH_RESULTS: usize = 10;
/// The Data API rejects `maxResults` above 50.
const MAX_SEARCH_RESULTS: usize = 50;

/// Served at `/` when no web root is configured.
const FALLBACK_INDEX_HTML: &str = "<!doctype html>\n<html><head><title>vidbridge</title></head>\n\
<body><h1>vidbridge</h1><p>The API lives under <code>/api</code>.</p></body></html>\n";

#[derive(Debug, Clone)]
struct BackendArgs {
    env_file: PathBuf,
    port: Option<u16>,
    host: Option<IpAddr>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut env_file: Option<PathBuf> = None;
        let mut port: Option<u16> = None;
        let mut host: Option<IpAddr> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--env-file=") {
                env_file = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host = Some(parse_host_arg(value)?);
                continue;
            }

            match arg.as_str() {
                "--env-file" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--env-file requires a value"))?;
                    env_file = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host = Some(parse_host_arg(&value)?);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        Ok(Self {
            env_file: env_file.unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH)),
            port,
            host,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/HOST")
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    settings: Arc<Settings>,
    api: Option<Arc<YoutubeApiClient>>,
    jobs: JobStore,
}

impl AppState {
    fn new(settings: Settings) -> Self {
        let api = settings
            .youtube_api_key
            .as_deref()
            .map(|key| Arc::new(YoutubeApiClient::new(key)));
        Self {
            settings: Arc::new(settings),
            api,
            jobs: JobStore::new(),
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
struct VideoInfoRequest {
    url: Option<String>,
}

#[derive(Deserialize)]
struct DirectUrlRequest {
    url: Option<String>,
    quality: Option<String>,
    format: Option<String>,
}

#[derive(Deserialize)]
struct SearchRequest {
    query: Option<String>,
    #[serde(rename = "maxResults")]
    max_results: Option<usize>,
    #[serde(rename = "type")]
    mode: Option<String>,
}

#[derive(Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    quality: Option<String>,
    format: Option<String>,
}

#[derive(Serialize)]
struct DirectUrlResponse {
    direct_url: String,
    filename: String,
    ext: String,
    format_id: Option<String>,
    height: Option<i64>,
    source: Provenance,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
    source: Provenance,
}

#[derive(Serialize)]
struct DownloadResponse {
    download_id: String,
}

#[derive(Serialize)]
struct DownloadEntry {
    filename: String,
    size: u64,
    modified: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let BackendArgs {
        env_file,
        port,
        host,
    } = BackendArgs::parse()?;

    let settings = Settings::load_from(&env_file)?;

    // DEBUG wins over LOG_LEVEL; it exists for quick verbose runs.
    let directive = if settings.debug {
        "debug"
    } else {
        settings.log_level.as_str()
    };
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    ensure_not_root("backend")?;

    if settings.secret_key_is_dev_default() {
        tracing::warn!("SECRET_KEY is the development default; set it before exposing this server");
    }
    if let Err(err) = ensure_ytdlp_available() {
        tracing::warn!("yt-dlp unavailable at startup: {err:#}");
    }
    if settings.youtube_api_key.is_none() {
        tracing::info!("no YouTube API key configured; metadata and search use yt-dlp only");
    }

    std::fs::create_dir_all(&settings.download_dir)
        .with_context(|| format!("creating download dir {}", settings.download_dir.display()))?;

    let port = port.unwrap_or(settings.port);
    let host = match host {
        Some(host) => host,
        None => parse_host_arg(&settings.host)?,
    };

    let cors = cors_layer(&settings.cors_origins);
    let body_limit = DefaultBodyLimit::max(settings.max_body_bytes);
    let state = AppState::new(settings);
    let jobs = state.jobs.clone();

    let app = Router::new()
        .route("/api/video-info", post(video_info))
        .route("/api/direct-url", post(direct_url))
        .route("/api/search", post(search))
        .route("/api/download", post(start_download))
        .route("/api/progress/{download_id}", get(download_progress))
        .route("/api/downloads", get(list_downloads))
        .route("/api/download-file/{filename}", get(download_file))
        .fallback(static_fallback)
        .layer(cors)
        .layer(body_limit)
        .with_state(state);

    let addr = SocketAddr::new(host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    tracing::info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    jobs.drain();
    Ok(())
}

async fn shutdown_signal() {
    // We do not propagate this error up because it only affects graceful
    // shutdown; the process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!("failed to install Ctrl+C handler: {err}");
    }
}

fn cors_layer(origins: &CorsOrigins) -> CorsLayer {
    match origins {
        CorsOrigins::Any => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
        CorsOrigins::List(list) => {
            let values: Vec<HeaderValue> = list
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(values))
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }
}

async fn video_info(
    State(state): State<AppState>,
    Json(payload): Json<VideoInfoRequest>,
) -> ApiResult<Json<VideoMetadata>> {
    let url = validated_url(payload.url.as_deref())?;
    let metadata = resolve_video_info(&state, url).await?;
    Ok(Json(metadata))
}

/// API first when the URL is a YouTube link with a parsable id and a key is
/// configured; every other case, and every API miss or failure, goes through
/// the extraction chain.
async fn resolve_video_info(state: &AppState, url: String) -> ApiResult<VideoMetadata> {
    if is_youtube_url(&url)
        && let Some(video_id) = extract_youtube_id(&url)
        && let Some(api) = state.api.clone()
    {
        let lookup = tokio::task::spawn_blocking(move || api.video_info(&video_id))
            .await
            .map_err(|err| ApiError::internal(err.to_string()))?;
        match lookup {
            Ok(Some(info)) => return Ok(metadata_from_api(info)),
            Ok(None) => {
                tracing::info!(url, "official API found no video; falling back to extraction");
            }
            Err(err) => {
                tracing::warn!(url, "official API lookup failed: {err:#}");
            }
        }
    }

    let cookies = state.settings.cookies.clone();
    let info =
        tokio::task::spawn_blocking(move || extractor::extract_with_fallback(&url, &cookies))
            .await
            .map_err(|err| ApiError::internal(err.to_string()))?
            .map_err(|err| {
                ApiError::bad_request(format!("video unavailable or blocked: {err:#}"))
            })?;
    Ok(metadata_from_extraction(info))
}

fn metadata_from_api(info: ApiVideoInfo) -> VideoMetadata {
    let mut formats = basic_format_options();
    formats.extend(api_format_options());
    VideoMetadata {
        title: info.title,
        duration: info.duration,
        uploader: info.uploader,
        thumbnail: info.thumbnail,
        formats,
        source: Provenance::OfficialApi,
    }
}

fn metadata_from_extraction(info: ExtractedInfo) -> VideoMetadata {
    let mut formats = basic_format_options();
    formats.extend(extractor_format_options(
        info.formats.as_deref().unwrap_or(&[]),
    ));
    VideoMetadata {
        title: info.title_or_default().to_string(),
        duration: info.duration_seconds(),
        uploader: info.uploader_or_default().to_string(),
        thumbnail: info.thumbnail.clone().unwrap_or_default(),
        formats,
        source: Provenance::Extractor,
    }
}

async fn direct_url(
    State(state): State<AppState>,
    Json(payload): Json<DirectUrlRequest>,
) -> ApiResult<Json<DirectUrlResponse>> {
    let url = validated_url(payload.url.as_deref())?;
    let quality = payload.quality.unwrap_or_else(|| "best".to_string());
    let format_type = payload
        .format
        .unwrap_or_else(|| "mp4".to_string())
        .to_lowercase();

    let cookies = state.settings.cookies.clone();
    let info = tokio::task::spawn_blocking(move || {
        extractor::extract_with_fallback(&url, &cookies)
    })
    .await
    .map_err(|err| ApiError::internal(err.to_string()))?
    .map_err(direct_url_error)?;

    let selected = pick_direct_format(&info, &quality, &format_type).map_err(direct_url_error)?;
    let direct = selected
        .url
        .clone()
        .ok_or_else(|| direct_url_error(anyhow!("selected format carries no URL")))?;

    let ext = selected
        .ext
        .clone()
        .unwrap_or_else(|| default_ext(&format_type).to_string());
    Ok(Json(DirectUrlResponse {
        direct_url: direct,
        filename: output_filename(info.title_or_default(), &ext),
        ext,
        format_id: selected.format_id.clone(),
        height: selected.height,
        source: Provenance::Extractor,
    }))
}

fn direct_url_error(err: anyhow::Error) -> ApiError {
    ApiError::bad_request(format!("could not resolve direct link: {err:#}"))
}

async fn search(
    State(state): State<AppState>,
    Json(payload): Json<SearchRequest>,
) -> ApiResult<Json<SearchResponse>> {
    let query = payload
        .query
        .as_deref()
        .map(str::trim)
        .filter(|query| !query.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing query"))?
        .to_string();
    let max_results = payload
        .max_results
        .unwrap_or(DEFAULT_MAX_SEARCH_RESULTS)
        .clamp(1, MAX_SEARCH_RESULTS);
    let mode = SearchMode::parse(payload.mode.as_deref());

    let api = state.api.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let api_ref = api.as_deref().map(|client| client as &dyn ApiSearch);
        hybrid_search(api_ref, mode, &query, max_results)
    })
    .await
    .map_err(|err| ApiError::internal(err.to_string()))?
    .map_err(|err| ApiError::internal(format!("search failed: {err:#}")))?;

    Ok(Json(SearchResponse {
        results: outcome.results,
        source: outcome.source,
    }))
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadResponse>> {
    let url = validated_url(payload.url.as_deref())?;
    let quality = payload.quality.unwrap_or_else(|| "best".to_string());
    let format_type = payload
        .format
        .unwrap_or_else(|| "mp4".to_string())
        .to_lowercase();

    tokio::fs::create_dir_all(&state.settings.download_dir)
        .await
        .map_err(|err| ApiError::internal(format!("preparing download dir: {err}")))?;

    let download_id = spawn_download(
        &state.jobs,
        DownloadPlan {
            url,
            quality,
            format_type,
            download_dir: state.settings.download_dir.clone(),
            cookies: state.settings.cookies.clone(),
            deadline: DOWNLOAD_DEADLINE,
        },
    );
    Ok(Json(DownloadResponse { download_id }))
}

async fn download_progress(
    State(state): State<AppState>,
    AxumPath(download_id): AxumPath<String>,
) -> Json<JobSnapshot> {
    Json(state.jobs.snapshot(&download_id))
}

async fn list_downloads(State(state): State<AppState>) -> ApiResult<Json<Vec<DownloadEntry>>> {
    let entries = read_download_entries(&state.settings.download_dir)
        .await
        .map_err(|err| ApiError::internal(format!("listing downloads: {err}")))?;
    Ok(Json(entries))
}

async fn read_download_entries(dir: &Path) -> std::io::Result<Vec<DownloadEntry>> {
    let mut entries = Vec::new();
    let mut reader = match tokio::fs::read_dir(dir).await {
        Ok(reader) => reader,
        // A missing directory just means nothing was downloaded yet.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(err) => return Err(err),
    };
    while let Some(entry) = reader.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata
            .modified()
            .map(|time| DateTime::<Utc>::from(time).to_rfc3339())
            .unwrap_or_default();
        entries.push(DownloadEntry {
            filename: entry.file_name().to_string_lossy().into_owned(),
            size: metadata.len(),
            modified,
        });
    }
    entries.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(entries)
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> ApiResult<Response> {
    if !is_safe_path_segment(&filename) {
        return Err(ApiError::not_found("file not found"));
    }
    let path = state.settings.download_dir.join(&filename);
    serve_attachment(path, &filename).await
}

async fn serve_attachment(path: PathBuf, filename: &str) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let stream = ReaderStream::new(file);
    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = mime.to_string().parse()
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', "_"));
    if let Ok(value) = disposition.parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match &state.settings.web_root {
        Some(root) => match serve_web_path(root, path).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        },
        None if path == "/" => Html(FALLBACK_INDEX_HTML).into_response(),
        None => ApiError::not_found("file not found").into_response(),
    }
}

async fn serve_web_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_web_path(root, request_path)?;
    let metadata = tokio::fs::metadata(&target).await;

    match metadata {
        Ok(meta) if meta.is_dir() => serve_plain_file(root.join("index.html")).await,
        Ok(_) => serve_plain_file(target).await,
        Err(_) if should_fallback_to_index(request_path) => {
            serve_plain_file(root.join("index.html")).await
        }
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

async fn serve_plain_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

fn resolve_web_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return true;
    }
    Path::new(trimmed).extension().is_none()
}

/// Validates and normalizes the URL field shared by several request bodies.
fn validated_url(url: Option<&str>) -> ApiResult<String> {
    let url = url
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("invalid URL"))?;
    if !is_valid_url(url) {
        return Err(ApiError::bad_request("invalid URL"));
    }
    Ok(normalize_url(url))
}
