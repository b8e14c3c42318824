#![forbid(unsafe_code)]

//! Direct-link format selection.
//!
//! Given extracted metadata, a quality token (`best`/`worst`/`720`/`480`/
//! `bestaudio`/an exact format id) and a container family, picks the single
//! format record the client should fetch.

use std::cmp::Ordering;

use anyhow::{Result, bail};

use crate::metadata::{ExtractedInfo, FormatCandidate};
use crate::urls::slugify_title;

/// Containers preferred for audio-only delivery, most compatible first.
const AUDIO_FRIENDLY_EXTS: &[&str] = &["m4a", "mp4", "aac", "mp3"];

const ENUMERATED_QUALITIES: &[&str] = &["best", "worst", "720", "480", "bestaudio"];

pub fn is_audio_request(format_type: &str) -> bool {
    matches!(format_type, "mp3" | "audio" | "bestaudio")
}

/// Extension used when the extractor omits one.
pub fn default_ext(format_type: &str) -> &'static str {
    if is_audio_request(format_type) { "m4a" } else { "mp4" }
}

/// Filename returned alongside the direct URL: slugified title plus the
/// selected container extension.
pub fn output_filename(title: &str, ext: &str) -> String {
    format!("{}.{ext}", slugify_title(title))
}

/// Picks one concrete format record. See the ordered rules inline; every
/// path either returns a candidate or fails with a client-facing message.
pub fn pick_direct_format(
    info: &ExtractedInfo,
    quality: &str,
    format_type: &str,
) -> Result<FormatCandidate> {
    let formats = info.formats.as_deref().unwrap_or(&[]);

    // A single already-resolved URL with no format table (common for TikTok)
    // becomes a pseudo-format.
    if formats.is_empty() {
        if let Some(url) = &info.url {
            return Ok(FormatCandidate {
                format_id: Some(info.format_id.clone().unwrap_or_else(|| "direct".into())),
                ext: info.ext.clone(),
                height: info.height,
                vcodec: info.vcodec.clone(),
                acodec: info.acodec.clone(),
                url: Some(url.clone()),
                ..Default::default()
            });
        }
        bail!("no formats available for direct link");
    }

    if is_audio_request(format_type) {
        return pick_audio(formats);
    }

    // An exact format-id request bypasses the heuristics entirely.
    if !ENUMERATED_QUALITIES.contains(&quality) {
        if let Some(exact) = formats
            .iter()
            .find(|candidate| candidate.format_id.as_deref() == Some(quality))
        {
            return Ok(exact.clone());
        }
    }

    let progressive: Vec<&FormatCandidate> =
        formats.iter().filter(|f| f.is_progressive()).collect();

    if !progressive.is_empty() {
        return pick_video(&progressive, quality);
    }

    // No muxed stream at all: take the best-looking candidate overall.
    let mut all: Vec<&FormatCandidate> = formats.iter().collect();
    all.sort_by(|a, b| best_order(a, b));
    match all.first() {
        Some(candidate) => Ok((*candidate).clone()),
        None => bail!("no format available"),
    }
}

fn pick_audio(formats: &[FormatCandidate]) -> Result<FormatCandidate> {
    let mut audio: Vec<&FormatCandidate> = formats.iter().filter(|f| f.is_audio_only()).collect();
    if !audio.is_empty() {
        audio.sort_by(|a, b| {
            audio_ext_rank(a)
                .cmp(&audio_ext_rank(b))
                .then_with(|| audio_bitrate(b).cmp(&audio_bitrate(a)))
        });
        return Ok(audio[0].clone());
    }

    // No audio-only stream; a muxed file still carries the audio track. The
    // smallest one wins since video data is dead weight here.
    let mut progressive: Vec<&FormatCandidate> =
        formats.iter().filter(|f| f.is_progressive()).collect();
    if !progressive.is_empty() {
        progressive.sort_by(|a, b| {
            a.height_or_zero()
                .cmp(&b.height_or_zero())
                .then_with(|| mp4_rank(a).cmp(&mp4_rank(b)))
        });
        return Ok(progressive[0].clone());
    }

    bail!("no direct audio format found");
}

fn pick_video(progressive: &[&FormatCandidate], quality: &str) -> Result<FormatCandidate> {
    if quality == "worst" {
        let mut candidates = progressive.to_vec();
        candidates.sort_by(|a, b| {
            a.height_or_zero()
                .cmp(&b.height_or_zero())
                .then_with(|| mp4_rank(a).cmp(&mp4_rank(b)))
        });
        return Ok(candidates[0].clone());
    }

    if let ("720" | "480", Ok(target)) = (quality, quality.parse::<i64>()) {
        // At or below the target, closest first; otherwise the smallest
        // candidate above it.
        let mut below: Vec<&&FormatCandidate> = progressive
            .iter()
            .filter(|f| f.height_or_zero() > 0 && f.height_or_zero() <= target)
            .collect();
        if !below.is_empty() {
            below.sort_by(|a, b| {
                b.height_or_zero()
                    .cmp(&a.height_or_zero())
                    .then_with(|| mp4_rank(a).cmp(&mp4_rank(b)))
            });
            return Ok((**below[0]).clone());
        }
        let mut above: Vec<&&FormatCandidate> = progressive
            .iter()
            .filter(|f| f.height_or_zero() > target)
            .collect();
        if !above.is_empty() {
            above.sort_by(|a, b| {
                a.height_or_zero()
                    .cmp(&b.height_or_zero())
                    .then_with(|| mp4_rank(a).cmp(&mp4_rank(b)))
            });
            return Ok((**above[0]).clone());
        }
    }

    // `best` and anything unrecognized.
    let mut candidates = progressive.to_vec();
    candidates.sort_by(|a, b| best_order(a, b));
    Ok(candidates[0].clone())
}

/// Height descending, mp4 preferred, total bitrate descending.
fn best_order(a: &FormatCandidate, b: &FormatCandidate) -> Ordering {
    b.height_or_zero()
        .cmp(&a.height_or_zero())
        .then_with(|| mp4_rank(a).cmp(&mp4_rank(b)))
        .then_with(|| total_bitrate(b).cmp(&total_bitrate(a)))
}

fn mp4_rank(candidate: &FormatCandidate) -> u8 {
    if candidate.ext.as_deref() == Some("mp4") { 0 } else { 1 }
}

fn audio_ext_rank(candidate: &FormatCandidate) -> usize {
    candidate
        .ext
        .as_deref()
        .and_then(|ext| AUDIO_FRIENDLY_EXTS.iter().position(|known| *known == ext))
        .unwrap_or(AUDIO_FRIENDLY_EXTS.len())
}

/// Audio bitrate, falling back to total bitrate, in millibit/s for stable
/// integer ordering.
fn audio_bitrate(candidate: &FormatCandidate) -> i64 {
    (candidate.abr.or(candidate.tbr).unwrap_or(0.0) * 1000.0) as i64
}

fn total_bitrate(candidate: &FormatCandidate) -> i64 {
    (candidate.tbr.unwrap_or(0.0) * 1000.0) as i64
}
