//! Info Fetcher
//!
//! One-shot metadata lookup through `yt-dlp --dump-single-json`. Every
//! failure mode (bad URL, missing binary, non-zero exit, timeout, bad JSON)
//! collapses to `None`; the reason is logged.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::models::VideoMetadata;
use crate::process::{ProcessRunner, ProcessSpec, StreamKind};
use crate::tool_manager::Tool;
use crate::url_utils;

/// Where to find yt-dlp and how long a metadata call may take.
#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    pub yt_dlp_path: PathBuf,

    /// Extra arguments placed before every call's own arguments
    /// (e.g. proxy settings).
    pub global_args: Vec<String>,

    pub metadata_timeout: Duration,
}

impl YtDlpConfig {
    pub fn new(yt_dlp_path: PathBuf) -> Self {
        Self {
            yt_dlp_path,
            global_args: vec![],
            metadata_timeout: Duration::from_secs(30),
        }
    }
}

/// Bound on stderr kept for diagnostics.
const MAX_STDERR_LINES: usize = 200;

#[derive(Debug, Clone)]
pub struct InfoFetcher {
    cfg: YtDlpConfig,
}

impl InfoFetcher {
    pub fn new(cfg: YtDlpConfig) -> Self {
        Self { cfg }
    }

    pub fn yt_dlp_path(&self) -> &Path {
        &self.cfg.yt_dlp_path
    }

    pub fn metadata_args(url: &str) -> Vec<String> {
        [
            "--dump-single-json",
            "--skip-download",
            "--no-playlist",
            "--no-warnings",
            url,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    pub async fn fetch_info(&self, url: &str) -> Option<VideoMetadata> {
        let Some(url) = url_utils::normalize_video_url(url) else {
            log::debug!("fetch_info: rejecting unsupported URL {:?}", url);
            return None;
        };

        match tokio::time::timeout(self.cfg.metadata_timeout, self.run(&url)).await {
            Ok(Ok(meta)) => Some(meta),
            Ok(Err(e)) => {
                log::warn!("yt-dlp metadata fetch failed for {}: {:#}", url, e);
                None
            }
            Err(_) => {
                log::warn!(
                    "Metadata fetch timed out for {} after {:?}",
                    url,
                    self.cfg.metadata_timeout
                );
                None
            }
        }
    }

    async fn run(&self, url: &str) -> Result<VideoMetadata> {
        let spec = ProcessSpec::new(Tool::YtDlp, &self.cfg.yt_dlp_path)
            .args(self.cfg.global_args.iter().cloned())
            .args(Self::metadata_args(url));
        // Dropping the handle on timeout kills the child (kill_on_drop).
        let mut handle = ProcessRunner.start(spec)?;

        let mut stdout = String::new();
        let mut stderr_lines: Vec<String> = Vec::new();
        while let Some(line) = handle.next_line().await {
            match line.stream {
                StreamKind::Stdout => {
                    stdout.push_str(&line.text);
                    stdout.push('\n');
                }
                StreamKind::Stderr => {
                    if stderr_lines.len() < MAX_STDERR_LINES {
                        stderr_lines.push(line.text);
                    }
                }
            }
        }

        let exit = handle.wait().await?;
        if !exit.success() {
            return Err(anyhow!(
                "yt-dlp exited with status {:?}: {}",
                exit.code,
                stderr_lines.last().map(String::as_str).unwrap_or("")
            ));
        }

        parse_video_metadata(&stdout)
    }
}

/// Parse the single JSON document printed by `--dump-single-json`.
pub fn parse_video_metadata(json: &str) -> Result<VideoMetadata> {
    let v: Value = serde_json::from_str(json.trim())
        .map_err(|e| anyhow!("invalid yt-dlp JSON: {e}"))?;

    let title = v
        .get("title")
        .and_then(|x| x.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("yt-dlp JSON has no title"))?;

    // Prefer the top-level pick; otherwise the last (largest) listed one.
    let thumbnail_url = v
        .get("thumbnail")
        .and_then(|x| x.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            v.get("thumbnails")
                .and_then(|x| x.as_array())
                .and_then(|arr| arr.iter().rev().find_map(|t| t.get("url")?.as_str()))
                .map(|s| s.to_string())
        })
        .unwrap_or_default();

    let duration_seconds = v
        .get("duration")
        .and_then(|x| x.as_u64())
        .or_else(|| v.get("duration").and_then(|x| x.as_f64()).map(|f| f as u64));

    let uploader = v
        .get("uploader")
        .and_then(|x| x.as_str())
        .map(|s| s.to_string());
    let webpage_url = v
        .get("webpage_url")
        .and_then(|x| x.as_str())
        .map(|s| s.to_string());

    Ok(VideoMetadata {
        title,
        thumbnail_url,
        duration_seconds,
        uploader,
        webpage_url,
    })
}

/// Collapses bursts of lookups (one per keystroke) into a single process.
///
/// Every call waits out the window; only the most recent call inside it
/// runs, the superseded ones resolve to `None`.
#[derive(Debug, Clone)]
pub struct InfoDebouncer {
    fetcher: InfoFetcher,
    window: Duration,
    generation: Arc<AtomicU64>,
}

impl InfoDebouncer {
    pub fn new(fetcher: InfoFetcher, window: Duration) -> Self {
        Self {
            fetcher,
            window,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn fetch_info(&self, url: &str) -> Option<VideoMetadata> {
        let mine = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.window).await;
        if self.generation.load(Ordering::SeqCst) != mine {
            log::debug!("fetch_info for {:?} superseded", url);
            return None;
        }
        self.fetcher.fetch_info(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "id": "abc123",
        "title": "Never Gonna Give You Up",
        "thumbnail": "https://i.ytimg.com/vi/abc123/maxresdefault.jpg",
        "duration": 212.0,
        "uploader": "Rick Astley",
        "webpage_url": "https://www.youtube.com/watch?v=abc123"
    }"#;

    #[test]
    fn parses_metadata() {
        let m = parse_video_metadata(SAMPLE).unwrap();
        assert_eq!(m.title, "Never Gonna Give You Up");
        assert_eq!(
            m.thumbnail_url,
            "https://i.ytimg.com/vi/abc123/maxresdefault.jpg"
        );
        assert_eq!(m.duration_seconds, Some(212));
        assert_eq!(m.uploader.as_deref(), Some("Rick Astley"));
    }

    #[test]
    fn falls_back_to_thumbnails_list() {
        let m = parse_video_metadata(
            r#"{"title":"t","thumbnails":[{"url":"https://a/small.jpg"},{"url":"https://a/big.jpg"}]}"#,
        )
        .unwrap();
        assert_eq!(m.thumbnail_url, "https://a/big.jpg");
        assert_eq!(m.duration_seconds, None);
    }

    #[test]
    fn rejects_garbage_and_missing_title() {
        assert!(parse_video_metadata("not json").is_err());
        assert!(parse_video_metadata(r#"{"thumbnail":"x"}"#).is_err());
    }

    #[test]
    fn metadata_args_never_download() {
        let args = InfoFetcher::metadata_args("https://youtu.be/abc123");
        assert!(args.contains(&"--skip-download".to_string()));
        assert!(args.contains(&"--no-playlist".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/abc123"));
    }

    #[tokio::test]
    async fn invalid_url_short_circuits() {
        let f = InfoFetcher::new(YtDlpConfig::new(PathBuf::from("/bin/sh")));
        assert_eq!(f.fetch_info("https://example.com/video").await, None);
    }

    #[tokio::test]
    async fn missing_binary_is_none() {
        let f = InfoFetcher::new(YtDlpConfig::new(PathBuf::from("/no/such/yt-dlp")));
        assert_eq!(f.fetch_info("https://youtu.be/abc123").await, None);
    }

    #[cfg(unix)]
    fn fake(script: &str) -> InfoFetcher {
        let mut cfg = YtDlpConfig::new(PathBuf::from("/bin/sh"));
        cfg.global_args = vec!["-c".into(), script.into(), "yt-dlp".into()];
        cfg.metadata_timeout = Duration::from_secs(5);
        InfoFetcher::new(cfg)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fetches_through_subprocess() {
        let script = format!("cat <<'EOF'\n{SAMPLE}\nEOF");
        let m = fake(&script).fetch_info("youtu.be/abc123").await.unwrap();
        assert_eq!(m.title, "Never Gonna Give You Up");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_and_bad_output_are_none() {
        assert_eq!(
            fake("echo 'ERROR: Video unavailable' >&2; exit 1")
                .fetch_info("https://youtu.be/abc123")
                .await,
            None
        );
        assert_eq!(
            fake("echo hello").fetch_info("https://youtu.be/abc123").await,
            None
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_is_none() {
        let mut f = fake("sleep 10");
        f.cfg.metadata_timeout = Duration::from_millis(200);
        assert_eq!(f.fetch_info("https://youtu.be/abc123").await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn debouncer_runs_only_the_latest_request() {
        let script = format!("cat <<'EOF'\n{SAMPLE}\nEOF");
        let d = InfoDebouncer::new(fake(&script), Duration::from_millis(150));

        let first = {
            let d = d.clone();
            tokio::spawn(async move { d.fetch_info("https://youtu.be/abc").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = d.fetch_info("https://youtu.be/abc123").await;

        assert_eq!(first.await.unwrap(), None);
        assert_eq!(second.unwrap().title, "Never Gonna Give You Up");
    }
}
