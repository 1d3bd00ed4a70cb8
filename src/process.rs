//! Process Runner
//!
//! Spawns an external command with a verbatim argument list and exposes its
//! merged stdout/stderr as a stream of lines, a completion signal and an
//! idempotent terminate operation.

use std::path::{Path, PathBuf};
use std::process::Stdio;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{CoreError, CoreResult};
use crate::tool_manager::{is_executable_file, Tool};

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub text: String,
}

/// What to run. Arguments are never interpreted by a shell.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub tool: Tool,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(tool: Tool, program: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Exit information for a finished process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Start the process. Fails with `ExecutableNotFound` before spawning if
    /// the program is not an existing executable file.
    pub fn start(&self, spec: ProcessSpec) -> CoreResult<ProcessHandle> {
        if !is_executable_file(&spec.program) {
            return Err(CoreError::ExecutableNotFound {
                tool: spec.tool,
                path: spec.program,
            });
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so cancellation can signal the whole tree
        // (yt-dlp spawns ffmpeg as a child).
        #[cfg(unix)]
        cmd.process_group(0);

        // Hide console window on Windows
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(CoreError::Spawn)?;
        let pid = child.id();
        log::info!(
            "Spawned {} (pid {:?}) with args: {:?}",
            spec.program.display(),
            pid,
            spec.args
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, StreamKind::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, StreamKind::Stderr, tx));
        }

        Ok(ProcessHandle {
            program: spec.program,
            child,
            pid,
            lines: rx,
            readers,
            exit: None,
            terminated: false,
        })
    }
}

fn spawn_reader<R>(pipe: R, stream: StreamKind, tx: mpsc::UnboundedSender<OutputLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe).lines();
        loop {
            match reader.next_line().await {
                Ok(Some(text)) => {
                    if tx.send(OutputLine { stream, text }).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("Error reading {:?}: {}", stream, e);
                    break;
                }
            }
        }
    })
}

/// A running (or finished) external process. Owned by exactly one session.
#[derive(Debug)]
pub struct ProcessHandle {
    program: PathBuf,
    child: Child,
    pid: Option<u32>,
    lines: mpsc::UnboundedReceiver<OutputLine>,
    readers: Vec<JoinHandle<()>>,
    exit: Option<ExitInfo>,
    terminated: bool,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Next line from either pipe; `None` once both pipes are closed.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    /// Wait for the process to exit. Safe to call repeatedly.
    pub async fn wait(&mut self) -> std::io::Result<ExitInfo> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self.child.wait().await?;
        let exit = ExitInfo {
            code: status.code(),
        };
        self.exit = Some(exit);
        Ok(exit)
    }

    /// Non-blocking exit check.
    pub fn has_exited(&mut self) -> bool {
        if self.exit.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(ExitInfo {
                    code: status.code(),
                });
                true
            }
            Ok(None) => false,
            Err(e) => {
                log::debug!("try_wait failed for pid {:?}: {}", self.pid, e);
                false
            }
        }
    }

    /// Forcefully stop the direct child. A no-op if it already exited or was
    /// already terminated.
    pub fn terminate(&mut self) {
        if self.terminated || self.has_exited() {
            return;
        }
        self.terminated = true;
        if let Err(e) = self.child.start_kill() {
            log::warn!("Failed to kill pid {:?}: {}", self.pid, e);
        }
    }

    /// Stop forwarding output; used after a cancelled process is reaped so a
    /// surviving grandchild holding the pipes cannot keep readers alive.
    pub fn detach_output(&mut self) {
        for r in self.readers.drain(..) {
            r.abort();
        }
        self.lines.close();
    }
}
