//! Download Manager
//!
//! Owns the single download session: validates a request, builds the yt-dlp
//! argument list, supervises the process, turns its output into events and
//! finalizes the session exactly once.
//!
//! Concurrency policy: one session at a time. A start while a session is
//! Running or Cancelling is rejected with [`CoreError::SessionBusy`].

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::cancel::{CancellationController, MAX_GRACE};
use crate::error::{CoreError, CoreResult};
use crate::events::{self, ErrorCode, EventSender, SessionEvent};
use crate::models::{check_destination, DownloadRequest, Quality};
use crate::process::{ExitInfo, ProcessHandle, ProcessRunner, ProcessSpec, StreamKind};
use crate::progress::{self, ProgressParser, ProgressSnapshot};
use crate::tool_manager::{Tool, ToolLocator};
use crate::url_utils;

/// Configuration for download execution.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub tools: ToolLocator,
    /// Extra arguments placed before every yt-dlp invocation's own arguments.
    pub global_args: Vec<String>,
    pub concurrent_fragments: u32,
    pub retries: u32,
    /// Target container for audio extraction.
    pub audio_format: String,
    pub embed_thumbnail: bool,
    pub embed_metadata: bool,
    /// Grace delay between polite and forced termination on cancel.
    pub kill_grace: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            tools: ToolLocator::new(None, None),
            global_args: vec![],
            concurrent_fragments: 4,
            retries: 10,
            audio_format: "mp3".to_string(),
            embed_thumbnail: true,
            embed_metadata: true,
            kill_grace: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Cancelling,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Running | SessionState::Cancelling)
    }
}

/// Point-in-time view of the session slot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: Option<Uuid>,
    pub state: SessionState,
    pub last_progress: Option<ProgressSnapshot>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Slot {
    id: Option<Uuid>,
    state: SessionState,
    started_at: Option<DateTime<Utc>>,
    last_progress: Option<ProgressSnapshot>,
    cancelled: Arc<AtomicBool>,
    cancel_tx: Option<broadcast::Sender<()>>,
}

impl Slot {
    fn idle() -> Self {
        Self {
            id: None,
            state: SessionState::Idle,
            started_at: None,
            last_progress: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_tx: None,
        }
    }
}

/// Session Manager. Cheap to share behind an `Arc`; all state sits in the
/// slot mutex.
pub struct DownloadManager {
    config: DownloadConfig,
    event_tx: EventSender,
    slot: Arc<Mutex<Slot>>,
    runner: ProcessRunner,
    canceller: CancellationController,
}

impl DownloadManager {
    pub fn new(config: DownloadConfig, event_tx: EventSender) -> Self {
        let canceller = CancellationController::new(config.kill_grace);
        Self {
            config,
            event_tx,
            slot: Arc::new(Mutex::new(Slot::idle())),
            runner: ProcessRunner,
            canceller,
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let slot = self.slot.lock().await;
        SessionStatus {
            id: slot.id,
            state: slot.state,
            last_progress: slot.last_progress.clone(),
            started_at: slot.started_at,
        }
    }

    /// Start a download. Returns as soon as the process is running; the
    /// outcome arrives on the event channel.
    ///
    /// Precondition failures are reported twice: as the returned error and
    /// as an `Error` event carrying the rejected session id. A busy rejection
    /// only returns the error, the event stream belongs to the running
    /// session.
    pub async fn start_download(&self, request: DownloadRequest) -> CoreResult<Uuid> {
        let mut slot = self.slot.lock().await;
        if slot.state.is_active() {
            log::warn!("Rejecting download of {}: session {:?} is {:?}", request.source_url, slot.id, slot.state);
            return Err(CoreError::SessionBusy);
        }

        let id = Uuid::new_v4();
        let prepared = self.prepare(&request).and_then(|spec| self.runner.start(spec));
        let handle = match prepared {
            Ok(h) => h,
            Err(e) => {
                if e.is_precondition() {
                    log::warn!("Download {} rejected: {}", id, e);
                } else {
                    log::error!("Download {} could not start: {}", id, e);
                }
                events::emit(
                    &self.event_tx,
                    SessionEvent::Error {
                        id,
                        error_code: e.code(),
                        message: e.to_string(),
                    },
                );
                return Err(e);
            }
        };

        let (cancel_tx, cancel_rx) = broadcast::channel::<()>(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        *slot = Slot {
            id: Some(id),
            state: SessionState::Running,
            started_at: Some(Utc::now()),
            last_progress: None,
            cancelled: cancelled.clone(),
            cancel_tx: Some(cancel_tx),
        };
        log::info!("Download {} started for {}", id, request.source_url);
        events::emit(&self.event_tx, SessionEvent::Started { id });

        let supervisor = Supervisor {
            id,
            slot: self.slot.clone(),
            event_tx: self.event_tx.clone(),
            canceller: self.canceller,
            cancelled,
        };
        tokio::spawn(supervisor.run(handle, cancel_rx));

        Ok(id)
    }

    /// Cancel the running session. No-op (returns `false`) when nothing is
    /// running. Does not wait for teardown; the `Cancelled` event marks the
    /// return to Idle.
    pub async fn cancel(&self) -> bool {
        let mut slot = self.slot.lock().await;
        if slot.state != SessionState::Running {
            log::debug!("cancel: no running session (state {:?})", slot.state);
            return false;
        }
        slot.state = SessionState::Cancelling;
        slot.cancelled.store(true, Ordering::SeqCst);
        if let Some(ref tx) = slot.cancel_tx {
            let _ = tx.send(());
        }
        log::info!("Cancelling download {:?}", slot.id);
        true
    }

    /// Validate the request and produce the process to run.
    fn prepare(&self, request: &DownloadRequest) -> CoreResult<ProcessSpec> {
        let url = url_utils::normalize_video_url(&request.source_url)
            .ok_or_else(|| CoreError::InvalidUrl(request.source_url.clone()))?;
        let quality = request.format.parse_quality(&request.quality_token)?;
        check_destination(&request.destination_directory)?;
        let yt_dlp = self.config.tools.require(Tool::YtDlp)?;
        let ffmpeg = self.config.tools.require(Tool::Ffmpeg)?;

        let args = build_download_args(request, quality, &url, &ffmpeg, &self.config);
        Ok(ProcessSpec::new(Tool::YtDlp, yt_dlp)
            .args(self.config.global_args.iter().cloned())
            .args(args))
    }
}

/// Output template: the caller's sanitized filename, or the source title.
/// `%` in the caller's name is escaped so yt-dlp takes it literally.
pub fn output_template(request: &DownloadRequest) -> PathBuf {
    let name = match request.output_stem() {
        Some(stem) => format!("{}.%(ext)s", stem.replace('%', "%%")),
        None => "%(title)s.%(ext)s".to_string(),
    };
    request.destination_directory.join(name)
}

/// yt-dlp format selector preferring H.264/AAC in MP4, falling back to the
/// best streams of any codec.
pub fn video_format_selector(max_height: Option<u32>) -> String {
    match max_height {
        None => "bv*[ext=mp4][vcodec^=avc1]+ba[ext=m4a]/bv*+ba/b".to_string(),
        Some(h) => format!(
            "bv*[height<={h}][ext=mp4][vcodec^=avc1]+ba[ext=m4a]/bv*[height<={h}]+ba/b[height<={h}]"
        ),
    }
}

/// Build the ordered argument list for a download. `url` must already be
/// validated.
pub fn build_download_args(
    request: &DownloadRequest,
    quality: Quality,
    url: &str,
    ffmpeg_path: &Path,
    config: &DownloadConfig,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--newline".into(),
        "--progress".into(),
        "--no-playlist".into(),
        "--no-continue".into(),
        "--concurrent-fragments".into(),
        config.concurrent_fragments.max(1).to_string(),
        "--retries".into(),
        config.retries.to_string(),
        "--fragment-retries".into(),
        config.retries.to_string(),
        "-o".into(),
        output_template(request).to_string_lossy().into_owned(),
        "--ffmpeg-location".into(),
        ffmpeg_path.to_string_lossy().into_owned(),
    ];

    match quality {
        Quality::AudioKbps(kbps) => {
            args.extend([
                "-x".to_string(),
                "--audio-format".to_string(),
                config.audio_format.clone(),
                "--audio-quality".to_string(),
                format!("{kbps}K"),
            ]);
            if config.embed_thumbnail {
                args.push("--embed-thumbnail".into());
            }
            if config.embed_metadata {
                args.push("--embed-metadata".into());
            }
        }
        Quality::BestVideo | Quality::MaxHeight(_) => {
            let max_height = match quality {
                Quality::MaxHeight(h) => Some(h),
                _ => None,
            };
            args.extend([
                "-f".to_string(),
                video_format_selector(max_height),
                "--merge-output-format".to_string(),
                "mp4".to_string(),
                "--remux-video".to_string(),
                "mp4".to_string(),
                // Stream copy only; never re-encode behind the caller's back.
                "--postprocessor-args".to_string(),
                "Merger+ffmpeg:-c:v copy -c:a copy".to_string(),
            ]);
        }
    }

    args.push("--".into());
    args.push(url.to_string());
    args
}

/// Map yt-dlp's stderr to a stable code and a short user-facing message.
pub fn classify_failure(stderr: &str) -> (ErrorCode, String) {
    let lower = stderr.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["private video", "video is private"]) {
        return (ErrorCode::PrivateVideo, "This video is private.".to_string());
    }
    if has(&["sign in", "login required", "age-restricted", "use --cookies"]) {
        return (
            ErrorCode::LoginRequired,
            "This video requires signing in.".to_string(),
        );
    }
    if has(&["available in your country", "geo restrict", "geo-restrict"]) {
        return (
            ErrorCode::GeoRestricted,
            "This video is not available in your region.".to_string(),
        );
    }
    if lower.contains("requested format") && lower.contains("not available") {
        return (
            ErrorCode::FormatUnavailable,
            "The requested quality is not available for this video.".to_string(),
        );
    }
    if has(&["http error 403", "forbidden", "access denied"]) {
        return (
            ErrorCode::AccessDenied,
            "Access denied by the video host.".to_string(),
        );
    }
    if has(&["video unavailable", "has been removed", "is not available", "does not exist"]) {
        return (
            ErrorCode::VideoUnavailable,
            "This video is unavailable.".to_string(),
        );
    }
    if has(&["unsupported url", "unable to extract", "nsig extraction failed"]) {
        return (
            ErrorCode::ExtractorOutdated,
            "The downloader could not read this page. Updating yt-dlp may help.".to_string(),
        );
    }
    if has(&["timed out", "connection reset", "connection refused", "getaddrinfo", "network is unreachable"]) {
        return (
            ErrorCode::Network,
            "Network error. Check your connection and retry.".to_string(),
        );
    }

    let last_error = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with("ERROR:"))
        .map(|l| l.trim_start_matches("ERROR:").trim());

    let message = match last_error {
        Some(detail) if !detail.is_empty() => format!("Download failed: {detail}"),
        _ => "Download failed".to_string(),
    };
    (ErrorCode::Unknown, message)
}

/// Bounded tail of stderr kept for failure classification.
const STDERR_TAIL: usize = 50;

enum Outcome {
    Exited(ExitInfo),
    WaitFailed(std::io::Error),
    Cancelled,
}

/// Background task owning the process handle of one session.
struct Supervisor {
    id: Uuid,
    slot: Arc<Mutex<Slot>>,
    event_tx: EventSender,
    canceller: CancellationController,
    cancelled: Arc<AtomicBool>,
}

impl Supervisor {
    async fn run(self, mut handle: ProcessHandle, mut cancel_rx: broadcast::Receiver<()>) {
        let id = self.id;
        let mut parser = ProgressParser::new();
        let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);
        let mut final_path: Option<PathBuf> = None;
        let mut last_sent: Option<ProgressSnapshot> = None;
        let mut last_stage: Option<&'static str> = None;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel_rx.recv() => {
                    self.canceller.terminate_tree(&mut handle).await;
                    match tokio::time::timeout(MAX_GRACE, handle.wait()).await {
                        Ok(Ok(exit)) => log::info!("Download {} terminated (exit {:?})", id, exit.code),
                        Ok(Err(e)) => log::warn!("Download {}: wait after cancel failed: {}", id, e),
                        Err(_) => log::warn!("Download {}: process did not exit after forced kill", id),
                    }
                    handle.detach_output();
                    break Outcome::Cancelled;
                }
                line = handle.next_line() => {
                    let Some(line) = line else {
                        break match handle.wait().await {
                            Ok(exit) => Outcome::Exited(exit),
                            Err(e) => Outcome::WaitFailed(e),
                        };
                    };

                    if line.stream == StreamKind::Stderr {
                        log::debug!("yt-dlp stderr: {}", line.text);
                        if stderr_tail.len() == STDERR_TAIL {
                            stderr_tail.pop_front();
                        }
                        stderr_tail.push_back(line.text);
                        continue;
                    }

                    log::debug!("yt-dlp stdout: {}", line.text);
                    if self.cancelled.load(Ordering::SeqCst) {
                        continue;
                    }

                    if let Some(path) = progress::detect_destination(&line.text) {
                        // A new destination means a new stream; stale ETA/rate
                        // from the previous one must not carry over.
                        parser.reset();
                        final_path = Some(path);
                    }

                    if let Some(stage) = progress::detect_stage(&line.text) {
                        if last_stage != Some(stage) {
                            last_stage = Some(stage);
                            log::info!("Download {}: {}", id, stage);
                            events::emit(&self.event_tx, SessionEvent::PostProcessing {
                                id,
                                step: stage.to_string(),
                            });
                        }
                    }

                    if let Some(snap) = parser.parse(&line.text) {
                        if last_sent.as_ref() != Some(&snap) {
                            // Checked and emitted under the slot lock: once
                            // `cancel()` returns no further progress goes out.
                            let mut slot = self.slot.lock().await;
                            if slot.state == SessionState::Running {
                                log::debug!(
                                    "Download {}: {:.1}% ({:?} B/s, eta {:?}s)",
                                    id,
                                    snap.percent_complete,
                                    snap.rate_bytes_per_sec(),
                                    snap.eta_seconds()
                                );
                                last_sent = Some(snap.clone());
                                slot.last_progress = Some(snap.clone());
                                events::emit(&self.event_tx, SessionEvent::Progress { id, progress: snap });
                            }
                        }
                    }
                }
            }
        };

        self.finish(outcome, final_path, stderr_tail).await;
    }

    async fn finish(
        self,
        outcome: Outcome,
        final_path: Option<PathBuf>,
        stderr_tail: VecDeque<String>,
    ) {
        let id = self.id;
        // The terminal event is emitted under the slot lock so no new session
        // can start (and emit `Started`) before it.
        let mut slot = self.slot.lock().await;
        slot.cancel_tx = None;

        // A cancel request wins even if the process exited on its own first.
        let outcome = if self.cancelled.load(Ordering::SeqCst) {
            Outcome::Cancelled
        } else {
            outcome
        };
        let (state, event) = match outcome {
            Outcome::Cancelled => {
                log::info!("Download {} cancelled", id);
                (SessionState::Idle, SessionEvent::Cancelled { id })
            }
            Outcome::Exited(exit) if exit.success() => {
                log::info!("Download {} completed: {:?}", id, final_path);
                (SessionState::Completed, SessionEvent::Done { id, final_path })
            }
            Outcome::Exited(exit) => {
                let stderr = Vec::from(stderr_tail).join("\n");
                let (error_code, message) = classify_failure(&stderr);
                log::warn!(
                    "Download {} failed with exit code {:?} ({:?}): {}",
                    id,
                    exit.code,
                    error_code,
                    stderr_tail_last(&stderr)
                );
                (
                    SessionState::Failed,
                    SessionEvent::Error {
                        id,
                        error_code,
                        message,
                    },
                )
            }
            Outcome::WaitFailed(e) => {
                log::error!("Download {}: failed to wait for yt-dlp: {}", id, e);
                (
                    SessionState::Failed,
                    SessionEvent::Error {
                        id,
                        error_code: ErrorCode::ToolFailed,
                        message: format!("Download failed: {e}"),
                    },
                )
            }
        };

        slot.state = state;
        events::emit(&self.event_tx, event);
    }
}

fn stderr_tail_last(stderr: &str) -> &str {
    stderr.lines().last().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventReceiver;
    use crate::models::MediaFormat;

    fn request(dir: &Path) -> DownloadRequest {
        DownloadRequest {
            source_url: "https://youtu.be/abc123".to_string(),
            format: MediaFormat::AudioOnly,
            quality_token: "192".to_string(),
            destination_directory: dir.to_path_buf(),
            desired_filename: Some(String::new()),
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn audio_request_builds_extraction_args() {
        let req = DownloadRequest {
            destination_directory: PathBuf::from("/tmp/out"),
            ..request(Path::new("/tmp/out"))
        };
        let quality = req.format.parse_quality(&req.quality_token).unwrap();
        let args = build_download_args(
            &req,
            quality,
            "https://youtu.be/abc123",
            Path::new("/usr/bin/ffmpeg"),
            &DownloadConfig::default(),
        );

        assert!(args.contains(&"-x".to_string()));
        assert!(args.contains(&"--no-playlist".to_string()));
        assert!(args.contains(&"--no-continue".to_string()));
        assert_eq!(value_after(&args, "--audio-format"), Some("mp3"));
        assert_eq!(value_after(&args, "--audio-quality"), Some("192K"));
        assert_eq!(value_after(&args, "--ffmpeg-location"), Some("/usr/bin/ffmpeg"));
        let expected_template = Path::new("/tmp/out").join("%(title)s.%(ext)s");
        assert_eq!(
            value_after(&args, "-o"),
            Some(expected_template.to_string_lossy().as_ref())
        );
        assert!(!args.contains(&"-f".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/abc123"));
        assert_eq!(args[args.len() - 2], "--");
    }

    #[test]
    fn video_best_and_height_selectors() {
        let mut req = request(Path::new("/tmp/out"));
        req.format = MediaFormat::VideoContainer;
        req.desired_filename = Some("My: Clip".to_string());

        let best = build_download_args(
            &req,
            Quality::BestVideo,
            "https://youtu.be/abc123",
            Path::new("/usr/bin/ffmpeg"),
            &DownloadConfig::default(),
        );
        assert_eq!(
            value_after(&best, "-f"),
            Some("bv*[ext=mp4][vcodec^=avc1]+ba[ext=m4a]/bv*+ba/b")
        );
        assert_eq!(value_after(&best, "--merge-output-format"), Some("mp4"));
        assert_eq!(
            value_after(&best, "--postprocessor-args"),
            Some("Merger+ffmpeg:-c:v copy -c:a copy")
        );
        assert!(!best.contains(&"-x".to_string()));
        let expected_template = Path::new("/tmp/out").join("My_ Clip.%(ext)s");
        assert_eq!(
            value_after(&best, "-o"),
            Some(expected_template.to_string_lossy().as_ref())
        );

        let capped = build_download_args(
            &req,
            Quality::MaxHeight(720),
            "https://youtu.be/abc123",
            Path::new("/usr/bin/ffmpeg"),
            &DownloadConfig::default(),
        );
        let selector = value_after(&capped, "-f").unwrap();
        assert!(selector.starts_with("bv*[height<=720]"));
        assert!(selector.ends_with("/b[height<=720]"));
    }

    #[test]
    fn classifies_known_failures() {
        let cases = [
            ("ERROR: [youtube] abc: Private video. Sign in if you've been granted access", ErrorCode::PrivateVideo),
            ("ERROR: [youtube] abc: Sign in to confirm your age", ErrorCode::LoginRequired),
            ("ERROR: [youtube] abc: Video unavailable", ErrorCode::VideoUnavailable),
            ("ERROR: unable to download video data: HTTP Error 403: Forbidden", ErrorCode::AccessDenied),
            ("ERROR: The uploader has not made this video available in your country", ErrorCode::GeoRestricted),
            ("ERROR: [youtube] abc: Requested format is not available", ErrorCode::FormatUnavailable),
            ("ERROR: Unsupported URL: https://x", ErrorCode::ExtractorOutdated),
            ("ERROR: Read timed out", ErrorCode::Network),
        ];
        for (stderr, code) in cases {
            assert_eq!(classify_failure(stderr).0, code, "stderr {stderr:?}");
        }
    }

    #[test]
    fn unknown_failure_keeps_last_error_line() {
        let (code, msg) = classify_failure("WARNING: meh\nERROR: something odd happened\n");
        assert_eq!(code, ErrorCode::Unknown);
        assert_eq!(msg, "Download failed: something odd happened");
        assert_eq!(classify_failure("").1, "Download failed");
    }

    // --- session tests against a fake downloader (sh -c <script>) ---

    #[cfg(unix)]
    fn fake_manager(script: &str) -> (DownloadManager, EventReceiver) {
        let config = DownloadConfig {
            tools: ToolLocator {
                yt_dlp_path: Some(PathBuf::from("/bin/sh")),
                ffmpeg_path: Some(PathBuf::from("/bin/sh")),
                ..ToolLocator::default()
            },
            global_args: vec!["-c".into(), script.into(), "yt-dlp".into()],
            kill_grace: Duration::from_millis(200),
            ..DownloadConfig::default()
        };
        let (tx, rx) = events::channel();
        (DownloadManager::new(config, tx), rx)
    }

    #[cfg(unix)]
    async fn next_event(rx: &mut EventReceiver) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[cfg(unix)]
    async fn drain_until_terminal(rx: &mut EventReceiver) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        loop {
            let ev = next_event(rx).await;
            let done = ev.is_terminal();
            out.push(ev);
            if done {
                return out;
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_download_emits_progress_then_single_done() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
echo '[youtube] abc123: Downloading webpage'
echo '[download] Destination: /tmp/out/Song.webm'
echo '[download]  42.5% of 10MiB at 1.20MiB/s ETA 00:08'
echo '[download]  42.5% of 10MiB at 1.20MiB/s ETA 00:08'
echo 'WARNING: something harmless' >&2
echo '[download] 100.0% of 10.00MiB at 2.00MiB/s ETA 00:00'
echo '[ExtractAudio] Destination: /tmp/out/Song.mp3'
exit 0
"#;
        let (mgr, mut rx) = fake_manager(script);
        let id = mgr.start_download(request(dir.path())).await.unwrap();

        let events = drain_until_terminal(&mut rx).await;
        assert!(matches!(events[0], SessionEvent::Started { id: sid } if sid == id));

        let progress: Vec<&ProgressSnapshot> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Progress { progress, .. } => Some(progress),
                _ => None,
            })
            .collect();
        assert_eq!(progress.len(), 2, "duplicate snapshot should be dropped");
        assert_eq!(progress[0].percent_complete, 42.5);
        assert_eq!(progress[0].estimated_time_remaining.as_deref(), Some("00:08"));
        assert_eq!(progress[0].transfer_rate.as_deref(), Some("1.20MiB/s"));
        assert_eq!(progress[1].percent_complete, 100.0);

        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::PostProcessing { step, .. } if step == "Extracting audio"
        )));
        match events.last().unwrap() {
            SessionEvent::Done { id: sid, final_path } => {
                assert_eq!(*sid, id);
                assert_eq!(final_path.as_deref(), Some(Path::new("/tmp/out/Song.mp3")));
            }
            other => panic!("expected Done, got {other:?}"),
        }
        assert_eq!(
            events.iter().filter(|e| e.is_terminal()).count(),
            1
        );

        let status = mgr.status().await;
        assert_eq!(status.state, SessionState::Completed);
        assert_eq!(status.last_progress.unwrap().percent_complete, 100.0);

        // Nothing after the terminal event.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_classified_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, mut rx) = fake_manager(
            "echo '[download]   1.0% of 1MiB' ; echo 'ERROR: [youtube] abc123: Private video' >&2; exit 1",
        );
        mgr.start_download(request(dir.path())).await.unwrap();

        let events = drain_until_terminal(&mut rx).await;
        match events.last().unwrap() {
            SessionEvent::Error { error_code, message, .. } => {
                assert_eq!(*error_code, ErrorCode::PrivateVideo);
                assert_eq!(message, "This video is private.");
            }
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::Done { .. })));
        assert_eq!(mgr.status().await.state, SessionState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_before_progress_is_silent_apart_from_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, mut rx) = fake_manager("sleep 30");
        let id = mgr.start_download(request(dir.path())).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Started { .. }));

        assert!(mgr.cancel().await);
        // Second cancel while tearing down is a no-op.
        assert!(!mgr.cancel().await);

        match next_event(&mut rx).await {
            SessionEvent::Cancelled { id: sid } => assert_eq!(sid, id),
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert_eq!(mgr.status().await.state, SessionState::Idle);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err(), "no done/error after cancel");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
echo '[download]  10.0% of 10MiB at 1.00MiB/s ETA 00:09'
sleep 30 &
wait
"#;
        let (mgr, mut rx) = fake_manager(script);
        mgr.start_download(request(dir.path())).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Started { .. }));
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Progress { .. }));

        let started = std::time::Instant::now();
        assert!(mgr.cancel().await);
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn no_progress_after_cancel_returns() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
i=1
while [ $i -lt 100 ]; do
  echo "[download]  $i.0% of 10MiB at 1.00MiB/s ETA 00:09"
  i=$((i+1))
  sleep 0.02
done
sleep 30
"#;
        let (mgr, mut rx) = fake_manager(script);
        mgr.start_download(request(dir.path())).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Started { .. }));
        for _ in 0..3 {
            assert!(matches!(next_event(&mut rx).await, SessionEvent::Progress { .. }));
        }

        assert!(mgr.cancel().await);
        // Progress is recorded and emitted together under the slot lock, so
        // this is the last snapshot sent before the cancel took effect.
        let last_before_cancel = mgr.status().await.last_progress;
        assert!(last_before_cancel.is_some());

        let mut last_received = None;
        loop {
            match next_event(&mut rx).await {
                SessionEvent::Progress { progress, .. } => last_received = Some(progress),
                SessionEvent::Cancelled { .. } => break,
                other => panic!("unexpected event while cancelling: {other:?}"),
            }
        }
        if let Some(received) = last_received {
            assert_eq!(Some(received), last_before_cancel, "progress emitted after cancel");
        }
        assert_eq!(mgr.status().await.last_progress, last_before_cancel);
    }

    #[test]
    fn output_template_escapes_percent_in_custom_name() {
        let mut req = request(Path::new("/tmp/out"));
        req.desired_filename = Some("100%(id)s".to_string());
        let expected = Path::new("/tmp/out").join("100%%(id)s.%(ext)s");
        assert_eq!(output_template(&req), expected);

        req.desired_filename = None;
        assert_eq!(output_template(&req), Path::new("/tmp/out").join("%(title)s.%(ext)s"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, mut rx) = fake_manager("sleep 30");
        mgr.start_download(request(dir.path())).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Started { .. }));

        let err = mgr.start_download(request(dir.path())).await.unwrap_err();
        assert!(matches!(err, CoreError::SessionBusy));
        assert!(rx.try_recv().is_err(), "busy rejection must not emit events");

        mgr.cancel().await;
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Cancelled { .. }));

        // Idle again: a new session may start.
        mgr.start_download(request(dir.path())).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Started { .. }));
        mgr.cancel().await;
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Cancelled { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_when_idle_is_a_noop() {
        let (mgr, mut rx) = fake_manager("exit 0");
        assert!(!mgr.cancel().await);
        assert!(rx.try_recv().is_err());
        assert_eq!(mgr.status().await.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = events::channel();
        let mgr = DownloadManager::new(DownloadConfig::default(), tx);

        let mut req = request(dir.path());
        req.source_url = "https://example.com/not-a-video".to_string();
        let err = mgr.start_download(req).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidUrl(_)));

        match rx.try_recv().unwrap() {
            SessionEvent::Error { error_code, .. } => assert_eq!(error_code, ErrorCode::InvalidUrl),
            other => panic!("expected Error, got {other:?}"),
        }
        assert_eq!(mgr.status().await.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn missing_downloader_is_an_environment_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = DownloadConfig {
            tools: ToolLocator {
                yt_dlp_path: Some(PathBuf::from("/no/such/yt-dlp")),
                ffmpeg_path: Some(PathBuf::from("/no/such/ffmpeg")),
                ..ToolLocator::default()
            },
            ..DownloadConfig::default()
        };
        let (tx, mut rx) = events::channel();
        let mgr = DownloadManager::new(config, tx);

        let err = mgr.start_download(request(dir.path())).await.unwrap_err();
        assert!(matches!(err, CoreError::ExecutableNotFound { tool: Tool::YtDlp, .. }));
        match rx.try_recv().unwrap() {
            SessionEvent::Error { error_code, .. } => assert_eq!(error_code, ErrorCode::ToolMissing),
            other => panic!("expected Error, got {other:?}"),
        }
        assert_eq!(mgr.status().await.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn missing_destination_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = events::channel();
        let mgr = DownloadManager::new(DownloadConfig::default(), tx);

        let err = mgr
            .start_download(request(&dir.path().join("missing")))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DestinationMissing(_)));
    }
}
