use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::progress::ProgressSnapshot;

/// Stable error codes so a UI can map failures to its own wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unknown,
    InvalidUrl,
    InvalidRequest,
    InvalidDestination,
    ToolMissing,
    ToolFailed,
    Busy,
    VideoUnavailable,
    PrivateVideo,
    LoginRequired,
    AccessDenied,
    GeoRestricted,
    FormatUnavailable,
    Network,
    ExtractorOutdated,
}

/// Core -> caller events.
///
/// Per session the order is `Started`, any number of `Progress` /
/// `PostProcessing`, then exactly one of `Done`, `Error` or `Cancelled`.
/// A request rejected during validation produces a lone `Error`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    Started {
        id: Uuid,
    },
    Progress {
        id: Uuid,
        progress: ProgressSnapshot,
    },
    PostProcessing {
        id: Uuid,
        step: String,
    },
    Done {
        id: Uuid,
        final_path: Option<PathBuf>,
    },
    Error {
        id: Uuid,
        error_code: ErrorCode,
        message: String,
    },
    Cancelled {
        id: Uuid,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            SessionEvent::Started { id }
            | SessionEvent::Progress { id, .. }
            | SessionEvent::PostProcessing { id, .. }
            | SessionEvent::Done { id, .. }
            | SessionEvent::Error { id, .. }
            | SessionEvent::Cancelled { id } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::Done { .. } | SessionEvent::Error { .. } | SessionEvent::Cancelled { .. }
        )
    }
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Send without caring whether the caller is still listening.
pub(crate) fn emit(tx: &EventSender, event: SessionEvent) {
    if tx.send(event).is_err() {
        log::debug!("event receiver dropped; discarding event");
    }
}
