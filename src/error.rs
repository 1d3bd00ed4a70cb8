//! Error taxonomy for the download core.
//!
//! Validation and environment errors are raised before any process is spawned.
//! Process failures are terminal for the session. Teardown problems during
//! cancellation never show up here; they are logged by the cancellation path.

use std::path::PathBuf;

use thiserror::Error;

use crate::events::ErrorCode;
use crate::tool_manager::Tool;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not a recognized video URL: {0}")]
    InvalidUrl(String),

    #[error("invalid quality `{token}` for {format}")]
    InvalidQuality { token: String, format: &'static str },

    #[error("destination folder does not exist: {}", .0.display())]
    DestinationMissing(PathBuf),

    #[error("destination folder is not writable: {}", .0.display())]
    DestinationNotWritable(PathBuf),

    #[error("{} not found at {}", .tool.as_str(), .path.display())]
    ExecutableNotFound { tool: Tool, path: PathBuf },

    #[error("a download is already running")]
    SessionBusy,

    #[error("failed to start process: {0}")]
    Spawn(#[source] std::io::Error),
}

impl CoreError {
    /// Stable code surfaced to the UI alongside the message.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::InvalidUrl(_) => ErrorCode::InvalidUrl,
            CoreError::InvalidQuality { .. } => ErrorCode::InvalidRequest,
            CoreError::DestinationMissing(_) | CoreError::DestinationNotWritable(_) => {
                ErrorCode::InvalidDestination
            }
            CoreError::ExecutableNotFound { .. } => ErrorCode::ToolMissing,
            CoreError::SessionBusy => ErrorCode::Busy,
            CoreError::Spawn(_) => ErrorCode::ToolFailed,
        }
    }

    /// True for errors detected before anything was spawned.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidUrl(_)
                | CoreError::InvalidQuality { .. }
                | CoreError::DestinationMissing(_)
                | CoreError::DestinationNotWritable(_)
                | CoreError::ExecutableNotFound { .. }
        )
    }
}
