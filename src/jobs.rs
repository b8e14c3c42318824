#![forbid(unsafe_code)]

//! Download job store and background runner.
//!
//! Every download gets a timestamp-derived id and a record in a shared map.
//! The record is written only by the worker owning that job and read by the
//! progress endpoint. Terminal records are retained up to a cap and evicted
//! oldest-first; running jobs are never evicted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::config::CookieConfig;
use crate::extractor::{self, push_cookie_args};
use crate::formats::is_audio_request;

/// Terminal records kept for polling before eviction kicks in.
const RETAINED_JOBS_CAP: usize = 256;

/// Per-attempt wall-clock limit; the child is killed on expiry.
pub const DOWNLOAD_DEADLINE: Duration = Duration::from_secs(300);

static PROGRESS_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[download\]\s+([\d.]+%)(?:.*?\bat\s+(\S+))?").unwrap());

static DESTINATION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(?:download|ExtractAudio|Merger)\][^:]*?(?:Destination:|into)\s+(.+)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Starting,
    Downloading,
    Finished,
    Error,
    NotFound,
}

impl JobStatus {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

/// What the progress endpoint returns. Percent and speed are passed through
/// verbatim as yt-dlp printed them.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobSnapshot {
    pub fn not_found() -> Self {
        Self {
            status: JobStatus::NotFound,
            percent: None,
            speed: None,
            filename: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
struct JobRecord {
    status: JobStatus,
    percent: Option<String>,
    speed: Option<String>,
    filename: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct JobStore {
    inner: Arc<JobStoreInner>,
}

struct JobStoreInner {
    jobs: Mutex<HashMap<String, JobRecord>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    counter: AtomicUsize,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(JobStoreInner {
                jobs: Mutex::new(HashMap::new()),
                handles: Mutex::new(Vec::new()),
                counter: AtomicUsize::new(1),
            }),
        }
    }

    /// Registers a new job in `starting` state and returns its id.
    pub fn allocate(&self) -> String {
        let sequence = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{}", Utc::now().timestamp_millis(), sequence);
        let mut jobs = self.inner.jobs.lock();
        jobs.insert(
            id.clone(),
            JobRecord {
                status: JobStatus::Starting,
                percent: None,
                speed: None,
                filename: None,
                error: None,
                created_at: Utc::now(),
            },
        );
        evict_terminal(&mut jobs);
        id
    }

    pub fn snapshot(&self, id: &str) -> JobSnapshot {
        match self.inner.jobs.lock().get(id) {
            Some(record) => JobSnapshot {
                status: record.status,
                percent: record.percent.clone(),
                speed: record.speed.clone(),
                filename: record.filename.clone(),
                error: record.error.clone(),
            },
            None => JobSnapshot::not_found(),
        }
    }

    fn set_downloading(&self, id: &str, percent: String, speed: Option<String>) {
        if let Some(record) = self.inner.jobs.lock().get_mut(id) {
            record.status = JobStatus::Downloading;
            record.percent = Some(percent);
            if speed.is_some() {
                record.speed = speed;
            }
        }
    }

    fn set_filename(&self, id: &str, filename: String) {
        if let Some(record) = self.inner.jobs.lock().get_mut(id) {
            record.filename = Some(filename);
        }
    }

    fn set_finished(&self, id: &str) {
        if let Some(record) = self.inner.jobs.lock().get_mut(id) {
            record.status = JobStatus::Finished;
            record.percent = Some("100%".to_string());
        }
    }

    fn set_error(&self, id: &str, message: String) {
        if let Some(record) = self.inner.jobs.lock().get_mut(id) {
            record.status = JobStatus::Error;
            record.error = Some(message);
        }
    }

    fn register_handle(&self, handle: JoinHandle<()>) {
        let mut handles = self.inner.handles.lock();
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
    }

    /// Aborts every outstanding worker. Children were spawned with
    /// `kill_on_drop`, so aborting the task also reaps the process.
    pub fn drain(&self) {
        let handles = std::mem::take(&mut *self.inner.handles.lock());
        let outstanding = handles.iter().filter(|handle| !handle.is_finished()).count();
        if outstanding > 0 {
            tracing::info!(outstanding, "aborting in-flight downloads for shutdown");
        }
        for handle in handles {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn insert_terminal_at(&self, id: &str, created_at: DateTime<Utc>) {
        self.inner.jobs.lock().insert(
            id.to_string(),
            JobRecord {
                status: JobStatus::Finished,
                percent: Some("100%".into()),
                speed: None,
                filename: None,
                error: None,
                created_at,
            },
        );
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.jobs.lock().len()
    }
}

/// Keeps the map bounded: when over cap, terminal records go first, oldest
/// first. Active jobs always survive.
fn evict_terminal(jobs: &mut HashMap<String, JobRecord>) {
    while jobs.len() > RETAINED_JOBS_CAP {
        let oldest_terminal = jobs
            .iter()
            .filter(|(_, record)| record.status.is_terminal())
            .min_by_key(|(_, record)| record.created_at)
            .map(|(id, _)| id.clone());
        match oldest_terminal {
            Some(id) => {
                jobs.remove(&id);
            }
            None => break,
        }
    }
}

/// Everything a worker needs; cloned into the spawned task.
#[derive(Debug, Clone)]
pub struct DownloadPlan {
    pub url: String,
    pub quality: String,
    pub format_type: String,
    pub download_dir: PathBuf,
    pub cookies: CookieConfig,
    /// Per-attempt wall-clock limit. [`DOWNLOAD_DEADLINE`] in production;
    /// tests shrink it to exercise the expiry path.
    pub deadline: Duration,
}

/// Secondary attempts tried when the primary download fails: different
/// device clients and a lowered resolution target. Heuristics, not protocol.
#[derive(Debug, Clone, Copy)]
struct DownloadAttempt {
    name: &'static str,
    player_clients: Option<&'static str>,
    height_cap: Option<i64>,
}

const DOWNLOAD_ATTEMPTS: &[DownloadAttempt] = &[
    DownloadAttempt {
        name: "primary",
        player_clients: None,
        height_cap: None,
    },
    DownloadAttempt {
        name: "mobile-clients",
        player_clients: Some("android,ios"),
        height_cap: Some(720),
    },
    DownloadAttempt {
        name: "tv-embedded-low",
        player_clients: Some("tv_embedded"),
        height_cap: Some(480),
    },
];

/// Allocates a job and launches its worker. Returns immediately with the id;
/// all outcomes are reported through the store.
pub fn spawn_download(store: &JobStore, plan: DownloadPlan) -> String {
    let id = store.allocate();
    let worker_store = store.clone();
    let worker_id = id.clone();
    let handle = tokio::spawn(async move {
        run_job(&worker_store, &worker_id, plan).await;
    });
    store.register_handle(handle);
    id
}

async fn run_job(store: &JobStore, id: &str, plan: DownloadPlan) {
    let mut last_error = String::from("no download attempts configured");
    for attempt in DOWNLOAD_ATTEMPTS {
        tracing::info!(job = id, attempt = attempt.name, url = %plan.url, "starting download attempt");
        match tokio::time::timeout(plan.deadline, run_attempt(store, id, &plan, attempt)).await {
            Ok(Ok(())) => {
                store.set_finished(id);
                tracing::info!(job = id, attempt = attempt.name, "download finished");
                return;
            }
            Ok(Err(err)) => {
                tracing::warn!(job = id, attempt = attempt.name, "download attempt failed: {err:#}");
                last_error = format!("{err:#}");
            }
            Err(_) => {
                tracing::warn!(job = id, attempt = attempt.name, "download attempt hit deadline");
                last_error = format!("download timed out after {}s", plan.deadline.as_secs());
            }
        }
    }
    store.set_error(id, last_error);
}

async fn run_attempt(
    store: &JobStore,
    id: &str,
    plan: &DownloadPlan,
    attempt: &DownloadAttempt,
) -> Result<()> {
    let args = download_args(plan, attempt);
    let mut child = tokio::process::Command::from(extractor::yt_dlp_command())
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("spawning yt-dlp for download")?;

    let stdout = child
        .stdout
        .take()
        .context("capturing yt-dlp stdout")?;
    let stderr = child
        .stderr
        .take()
        .context("capturing yt-dlp stderr")?;
    // Drained concurrently so a chatty stderr never backs up the pipe while
    // we block on stdout. Only the last non-empty line is kept.
    let stderr_tail = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut tail = None;
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                tail = Some(line);
            }
        }
        tail
    });

    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await.context("reading yt-dlp output")? {
        if let Some(destination) = parse_destination_line(&line) {
            store.set_filename(id, destination);
        } else if let Some(progress) = parse_progress_line(&line) {
            store.set_downloading(id, progress.percent, progress.speed);
        }
    }

    let status = child.wait().await.context("waiting for yt-dlp")?;
    let stderr_tail = stderr_tail.await.ok().flatten();
    if !status.success() {
        bail!(
            "yt-dlp exited with {status} ({})",
            stderr_tail.as_deref().unwrap_or("no stderr")
        );
    }
    Ok(())
}

fn download_args(plan: &DownloadPlan, attempt: &DownloadAttempt) -> Vec<String> {
    let output_template = plan.download_dir.join("%(title)s.%(ext)s");
    let mut args: Vec<String> = vec![
        "--newline".into(),
        "--no-warnings".into(),
        "--no-playlist".into(),
        "--format".into(),
        format_spec(&plan.quality, &plan.format_type, attempt.height_cap),
        "--output".into(),
        output_template.to_string_lossy().into_owned(),
    ];
    if is_audio_request(&plan.format_type) {
        args.push("--extract-audio".into());
        args.push("--audio-format".into());
        args.push("mp3".into());
    }
    if let Some(clients) = attempt.player_clients {
        args.push("--extractor-args".into());
        args.push(format!("youtube:player_client={clients}"));
    }
    push_cookie_args(&mut args, &plan.cookies);
    args.push(plan.url.clone());
    args
}

/// Maps the request's quality token onto a yt-dlp format specification,
/// optionally tightening the resolution for fallback attempts.
fn format_spec(quality: &str, format_type: &str, height_cap: Option<i64>) -> String {
    if is_audio_request(format_type) {
        return "bestaudio/best".to_string();
    }
    let capped = |target: i64| {
        format!("best[height<={target}][ext=mp4]/best[height<={target}]/best")
    };
    match quality {
        "worst" => "worst[ext=mp4]/worst".to_string(),
        "720" | "480" => {
            let target = quality.parse::<i64>().unwrap_or(720);
            capped(height_cap.map_or(target, |cap| cap.min(target)))
        }
        "best" | "" => match height_cap {
            Some(cap) => capped(cap),
            None => "best[ext=mp4]/best".to_string(),
        },
        exact => match height_cap {
            // Fallback attempts abandon the exact id; it already failed once.
            Some(cap) => capped(cap),
            None => exact.to_string(),
        },
    }
}

struct ProgressUpdate {
    percent: String,
    speed: Option<String>,
}

fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let captures = PROGRESS_LINE.captures(line)?;
    Some(ProgressUpdate {
        percent: captures[1].to_string(),
        speed: captures.get(2).map(|m| m.as_str().to_string()),
    })
}

fn parse_destination_line(line: &str) -> Option<String> {
    let captures = DESTINATION_LINE.captures(line)?;
    let path = PathBuf::from(captures[1].trim().trim_matches('"'));
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}
