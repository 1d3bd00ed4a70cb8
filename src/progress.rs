//! Progress scraping for yt-dlp's human-readable output.
//!
//! yt-dlp prints lines such as
//! `[download]  42.5% of 10.00MiB at 1.20MiB/s ETA 00:08`. Everything that
//! knows about that text format lives in this module.

use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// One progress measurement. Only the latest one matters to a UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// 0..=100
    pub percent_complete: f64,
    /// As printed by the downloader, e.g. `00:08`.
    pub estimated_time_remaining: Option<String>,
    /// As printed by the downloader, e.g. `1.20MiB/s`.
    pub transfer_rate: Option<String>,
}

impl ProgressSnapshot {
    pub fn eta_seconds(&self) -> Option<u64> {
        self.estimated_time_remaining.as_deref().and_then(parse_eta)
    }

    pub fn rate_bytes_per_sec(&self) -> Option<u64> {
        self.transfer_rate.as_deref().and_then(parse_speed)
    }
}

fn percent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,3}\.\d)%").expect("percent regex"))
}

fn eta_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ETA\s+((?:\d+:)?\d{2}:\d{2})").expect("eta regex"))
}

fn rate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+(?:\.\d+)?\s?[KMG]iB/s)").expect("rate regex"))
}

fn destination_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"^\[(?:download|ExtractAudio|VideoRemuxer)\] Destination: (.+)$|^\[Merger\] Merging formats into "(.+)"$|^\[download\] (.+) has already been downloaded"#,
        )
        .expect("destination regex")
    })
}

/// Extract a snapshot from one chunk of output. ETA and rate alone never
/// produce a snapshot.
pub fn parse_chunk(text: &str) -> Option<ProgressSnapshot> {
    let caps = percent_re().captures(text)?;
    let percent: f64 = caps.get(1)?.as_str().parse().ok()?;

    let estimated_time_remaining = eta_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let transfer_rate = rate_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    Some(ProgressSnapshot {
        percent_complete: percent.clamp(0.0, 100.0),
        estimated_time_remaining,
        transfer_rate,
    })
}

/// Stateful wrapper around [`parse_chunk`] that keeps the last good ETA and
/// rate so a line reporting `ETA Unknown` does not blank the display.
#[derive(Debug, Default)]
pub struct ProgressParser {
    last_eta: Option<String>,
    last_rate: Option<String>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, text: &str) -> Option<ProgressSnapshot> {
        let mut snap = parse_chunk(text)?;

        match snap.estimated_time_remaining {
            Some(ref eta) => self.last_eta = Some(eta.clone()),
            None => snap.estimated_time_remaining = self.last_eta.clone(),
        }
        match snap.transfer_rate {
            Some(ref rate) => self.last_rate = Some(rate.clone()),
            None => snap.transfer_rate = self.last_rate.clone(),
        }

        Some(snap)
    }

    /// Forget carried values, e.g. when yt-dlp moves from the video stream to
    /// the audio stream.
    pub fn reset(&mut self) {
        self.last_eta = None;
        self.last_rate = None;
    }
}

/// Post-processing step announced by a line, if any.
pub fn detect_stage(line: &str) -> Option<&'static str> {
    let tag = line.trim_start().strip_prefix('[')?;
    let tag = &tag[..tag.find(']')?];
    match tag {
        "Merger" => Some("Merging streams"),
        "ExtractAudio" => Some("Extracting audio"),
        "VideoRemuxer" => Some("Remuxing"),
        "EmbedThumbnail" => Some("Embedding thumbnail"),
        "Metadata" => Some("Writing metadata"),
        _ => None,
    }
}

/// Output file announced by a line, if any.
pub fn detect_destination(line: &str) -> Option<PathBuf> {
    let caps = destination_re().captures(line.trim_end())?;
    (1..=3)
        .find_map(|i| caps.get(i))
        .map(|m| PathBuf::from(m.as_str()))
}

/// `1.5MiB/s` -> bytes per second.
pub fn parse_speed(s: &str) -> Option<u64> {
    let s = s.trim();
    if s == "N/A" || s.is_empty() {
        return None;
    }

    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)([\d.]+)\s*(KiB|MiB|GiB|KB|MB|GB|B)").expect("speed regex"));
    let caps = re.captures(s)?;
    let num: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_ascii_uppercase();

    let multiplier: f64 = match unit.as_str() {
        "KB" | "KIB" => 1024.0,
        "MB" | "MIB" => 1024.0 * 1024.0,
        "GB" | "GIB" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };

    Some((num * multiplier) as u64)
}

/// `05:30` / `01:05:30` -> seconds.
pub fn parse_eta(s: &str) -> Option<u64> {
    let s = s.trim();
    if s == "N/A" || s.is_empty() {
        return None;
    }

    let parts: Vec<&str> = s.split(':').collect();
    match parts.len() {
        1 => parts[0].parse::<u64>().ok(),
        2 => {
            let mins: u64 = parts[0].parse().ok()?;
            let secs: u64 = parts[1].parse().ok()?;
            Some(mins * 60 + secs)
        }
        3 => {
            let hours: u64 = parts[0].parse().ok()?;
            let mins: u64 = parts[1].parse().ok()?;
            let secs: u64 = parts[2].parse().ok()?;
            Some(hours * 3600 + mins * 60 + secs)
        }
        _ => None,
    }
}
