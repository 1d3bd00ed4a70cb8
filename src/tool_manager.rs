//! Tool Manager
//!
//! Locates the external binaries (yt-dlp, ffmpeg) and runs a bounded
//! version probe to report their health.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    YtDlp,
    Ffmpeg,
}

impl Tool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::YtDlp => "yt-dlp",
            Tool::Ffmpeg => "ffmpeg",
        }
    }

    pub fn binary_name(&self) -> &'static str {
        #[cfg(target_os = "windows")]
        {
            match self {
                Tool::YtDlp => "yt-dlp.exe",
                Tool::Ffmpeg => "ffmpeg.exe",
            }
        }
        #[cfg(not(target_os = "windows"))]
        {
            match self {
                Tool::YtDlp => "yt-dlp",
                Tool::Ffmpeg => "ffmpeg",
            }
        }
    }

    pub fn version_args(&self) -> &[&str] {
        match self {
            Tool::YtDlp => &["--version"],
            Tool::Ffmpeg => &["-version"],
        }
    }

    /// Usual install locations outside of PATH (bundled macOS apps do not
    /// inherit the user's PATH).
    fn common_paths(&self) -> Vec<PathBuf> {
        let name = self.binary_name();
        let mut out: Vec<PathBuf> = ["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/opt/local/bin"]
            .iter()
            .map(|d| Path::new(d).join(name))
            .collect();
        if let Some(home) = dirs::home_dir() {
            out.push(home.join(".local/bin").join(name));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Missing,
    Broken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub tool: Tool,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
    pub status: ToolStatus,
    pub last_checked: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainStatus {
    pub yt_dlp: ToolInfo,
    pub ffmpeg: ToolInfo,
    pub overall_status: ToolStatus,
}

/// Resolves tool paths. An explicitly configured path always wins and is
/// never second-guessed: if it does not exist the tool is reported missing.
#[derive(Debug, Clone)]
pub struct ToolLocator {
    pub yt_dlp_path: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
    /// Directory holding binaries shipped next to the application.
    pub bundled_dir: Option<PathBuf>,
    pub version_timeout: Duration,
}

impl Default for ToolLocator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl ToolLocator {
    pub fn new(yt_dlp_path: Option<PathBuf>, ffmpeg_path: Option<PathBuf>) -> Self {
        let bundled_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|p| p.to_path_buf()));
        Self {
            yt_dlp_path,
            ffmpeg_path,
            bundled_dir,
            version_timeout: Duration::from_secs(5),
        }
    }

    fn configured(&self, tool: Tool) -> Option<&PathBuf> {
        match tool {
            Tool::YtDlp => self.yt_dlp_path.as_ref(),
            Tool::Ffmpeg => self.ffmpeg_path.as_ref(),
        }
    }

    /// Find the best available path for a tool.
    ///
    /// Priority:
    /// 1. Configured path
    /// 2. Bundled next to the executable
    /// 3. Common install locations
    /// 4. System PATH
    pub fn find(&self, tool: Tool) -> Option<PathBuf> {
        if let Some(p) = self.configured(tool) {
            return is_executable_file(p).then(|| p.clone());
        }

        if let Some(ref dir) = self.bundled_dir {
            let p = dir.join(tool.binary_name());
            if is_executable_file(&p) {
                log::debug!("Found bundled {} at {:?}", tool.as_str(), p);
                return Some(p);
            }
        }

        if let Some(p) = tool.common_paths().into_iter().find(|p| is_executable_file(p)) {
            log::debug!("Found {} at {:?}", tool.as_str(), p);
            return Some(p);
        }

        which::which(tool.binary_name()).ok()
    }

    /// Like [`find`](Self::find) but reports a missing tool as an
    /// environment error naming the path that was expected.
    pub fn require(&self, tool: Tool) -> CoreResult<PathBuf> {
        self.find(tool).ok_or_else(|| CoreError::ExecutableNotFound {
            tool,
            path: self
                .configured(tool)
                .cloned()
                .unwrap_or_else(|| PathBuf::from(tool.binary_name())),
        })
    }

    pub async fn tool_info(&self, tool: Tool) -> ToolInfo {
        let path = self.find(tool);
        let (version, status) = match path {
            Some(ref p) => match get_version(p, tool, self.version_timeout).await {
                Ok(v) => (Some(v), ToolStatus::Ok),
                Err(e) => {
                    log::warn!("{} at {:?} failed its version check: {:#}", tool.as_str(), p, e);
                    (None, ToolStatus::Broken)
                }
            },
            None => (None, ToolStatus::Missing),
        };

        ToolInfo {
            tool,
            path,
            version,
            status,
            last_checked: Utc::now(),
        }
    }

    pub async fn toolchain_status(&self) -> ToolchainStatus {
        let yt_dlp = self.tool_info(Tool::YtDlp).await;
        let ffmpeg = self.tool_info(Tool::Ffmpeg).await;

        let overall_status = if yt_dlp.status == ToolStatus::Missing || ffmpeg.status == ToolStatus::Missing {
            ToolStatus::Missing
        } else if yt_dlp.status == ToolStatus::Broken || ffmpeg.status == ToolStatus::Broken {
            ToolStatus::Broken
        } else {
            ToolStatus::Ok
        };

        ToolchainStatus {
            yt_dlp,
            ffmpeg,
            overall_status,
        }
    }
}

/// Existing regular file with an execute bit (any file on Windows).
pub fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Get the version string from a tool.
pub async fn get_version(path: &Path, tool: Tool, timeout: Duration) -> Result<String> {
    let mut cmd = Command::new(path);
    cmd.args(tool.version_args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .context("Version check timed out")?
        .context("Failed to execute tool")?;

    if !output.status.success() {
        return Err(anyhow!(
            "Tool returned non-zero exit code: {}",
            output.status
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_version(&stdout, tool).ok_or_else(|| anyhow!("Could not parse version from output"))
}

fn parse_version(output: &str, tool: Tool) -> Option<String> {
    let first_line = output.lines().next()?.trim();
    if first_line.is_empty() {
        return None;
    }

    match tool {
        // "2024.01.01"
        Tool::YtDlp => Some(first_line.to_string()),
        // "ffmpeg version 6.1.1 Copyright (c) ..."
        Tool::Ffmpeg => {
            let parts: Vec<&str> = first_line.split_whitespace().collect();
            if parts.len() >= 3 && parts[0] == "ffmpeg" && parts[1] == "version" {
                Some(parts[2].to_string())
            } else {
                Some(first_line.to_string())
            }
        }
    }
}
