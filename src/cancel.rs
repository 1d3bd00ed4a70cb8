//! Cancellation Controller
//!
//! Tears down a session's process tree. yt-dlp spawns ffmpeg for merging and
//! audio extraction, so killing the direct child is not enough. Only the
//! session's own process group (Unix) or process tree (Windows) is touched;
//! processes that merely share an executable name are left alone.
//!
//! Teardown is best-effort: every failure is logged and swallowed.

use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::process::ProcessHandle;

/// Upper bound for the forceful-kill grace delay.
pub const MAX_GRACE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Whether descendants of the direct child can be checked. Where they cannot
/// (Windows), the forced tree kill is always issued.
const TREE_OBSERVABLE: bool = cfg!(unix);

#[derive(Debug, Clone, Copy)]
pub struct CancellationController {
    grace: Duration,
}

impl Default for CancellationController {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl CancellationController {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace: grace.min(MAX_GRACE),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Politely stop the tree, wait up to the grace delay, then force it.
    /// Returns once the direct child has been reaped or the forced kill was
    /// issued.
    pub async fn terminate_tree(&self, handle: &mut ProcessHandle) {
        let Some(pid) = handle.pid() else {
            // Already reaped by tokio; nothing left to signal.
            handle.terminate();
            return;
        };

        log::info!(
            "Terminating {} process tree rooted at pid {}",
            handle.program().display(),
            pid
        );
        soft_kill_tree(pid);

        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if handle.has_exited() && !tree_alive(pid) {
                log::debug!("Process tree {} exited within grace period", pid);
                if !TREE_OBSERVABLE {
                    // ffmpeg may still be running under the exited root.
                    hard_kill_tree(pid);
                }
                return;
            }
            sleep(POLL_INTERVAL).await;
        }

        log::warn!(
            "Process tree {} still alive after {:?}; forcing termination",
            pid,
            self.grace
        );
        hard_kill_tree(pid);
        handle.terminate();
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: killpg has no memory-safety preconditions; the process group
    // was created for this session by `process_group(0)` at spawn time.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn soft_kill_tree(pid: u32) {
    if let Err(e) = signal_group(pid, libc::SIGTERM) {
        if e.raw_os_error() != Some(libc::ESRCH) {
            log::warn!("SIGTERM to process group {} failed: {}", pid, e);
        }
    }
}

#[cfg(unix)]
fn hard_kill_tree(pid: u32) {
    if let Err(e) = signal_group(pid, libc::SIGKILL) {
        if e.raw_os_error() != Some(libc::ESRCH) {
            log::warn!("SIGKILL to process group {} failed: {}", pid, e);
        }
    }
}

#[cfg(unix)]
fn tree_alive(pid: u32) -> bool {
    // Signal 0 only probes for existence.
    signal_group(pid, 0).is_ok()
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;

    let pid_str = pid.to_string();
    let mut args = vec!["/T", "/PID", pid_str.as_str()];
    if force {
        args.insert(0, "/F");
    }
    match std::process::Command::new("taskkill")
        .args(&args)
        .creation_flags(CREATE_NO_WINDOW)
        .output()
    {
        Ok(out) if out.status.success() => {}
        Ok(out) => log::warn!(
            "taskkill {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr).trim()
        ),
        Err(e) => log::warn!("Failed to execute taskkill: {}", e),
    }
}

#[cfg(windows)]
fn soft_kill_tree(pid: u32) {
    taskkill(pid, false);
}

#[cfg(windows)]
fn hard_kill_tree(pid: u32) {
    taskkill(pid, true);
}

#[cfg(windows)]
fn tree_alive(_pid: u32) -> bool {
    // Not observable; see TREE_OBSERVABLE.
    false
}

#[cfg(not(any(unix, windows)))]
fn soft_kill_tree(_pid: u32) {}

#[cfg(not(any(unix, windows)))]
fn hard_kill_tree(_pid: u32) {}

#[cfg(not(any(unix, windows)))]
fn tree_alive(_pid: u32) -> bool {
    false
}
