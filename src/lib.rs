//! ytgrab core: supervises yt-dlp (and the ffmpeg it drives) for a single
//! download at a time and reports progress as a stream of events.
//!
//! Hosts (the bundled CLI, or a GUI shell) talk to [`Core`] and consume
//! [`SessionEvent`]s from the receiver returned by [`Core::new`].

use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

pub mod cancel;
pub mod download_manager;
pub mod error;
pub mod events;
pub mod models;
pub mod process;
pub mod progress;
pub mod settings;
pub mod tool_manager;
pub mod url_utils;
pub mod ytdlp;

pub use download_manager::{DownloadConfig, DownloadManager, SessionState, SessionStatus};
pub use error::{CoreError, CoreResult};
pub use events::{ErrorCode, EventReceiver, EventSender, SessionEvent};
pub use models::{DownloadRequest, MediaFormat, Quality, VideoMetadata};
pub use progress::ProgressSnapshot;
pub use settings::Settings;
pub use tool_manager::{Tool, ToolchainStatus};

use tool_manager::ToolLocator;
use ytdlp::{InfoDebouncer, InfoFetcher, YtDlpConfig};

/// Entry point for hosts. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Core {
    settings: Arc<Settings>,
    tools: ToolLocator,
    downloads: Arc<DownloadManager>,
    info: InfoDebouncer,
}

impl Core {
    pub fn new(settings: Settings) -> (Self, EventReceiver) {
        let (event_tx, event_rx) = events::channel();
        let tools = settings.tool_locator();
        let downloads = Arc::new(DownloadManager::new(settings.download_config(), event_tx));
        let info = InfoDebouncer::new(build_info_fetcher(&settings, &tools), settings.info_debounce());

        let core = Self {
            settings: Arc::new(settings),
            tools,
            downloads,
            info,
        };
        (core, event_rx)
    }

    /// Destination used when a request names none.
    pub fn default_destination(&self) -> PathBuf {
        self.settings.download.download_folder.clone()
    }

    /// Metadata lookup. `None` on any failure.
    pub async fn get_info(&self, url: &str) -> Option<VideoMetadata> {
        build_info_fetcher(&self.settings, &self.tools).fetch_info(url).await
    }

    /// Metadata lookup for callers that fire on every keystroke. Superseded
    /// calls inside the debounce window resolve to `None`.
    pub async fn get_info_debounced(&self, url: &str) -> Option<VideoMetadata> {
        self.info.fetch_info(url).await
    }

    /// Start a download; progress and the outcome arrive as events.
    pub async fn download(&self, request: DownloadRequest) -> CoreResult<Uuid> {
        self.downloads.start_download(request).await
    }

    /// Cancel the running download. Returns `false` when nothing was running.
    pub async fn cancel_download(&self) -> bool {
        self.downloads.cancel().await
    }

    pub async fn status(&self) -> SessionStatus {
        self.downloads.status().await
    }

    pub async fn toolchain_status(&self) -> ToolchainStatus {
        self.tools.toolchain_status().await
    }
}

/// A missing yt-dlp is not an error here: the fetcher simply reports no
/// metadata and logs why.
fn build_info_fetcher(settings: &Settings, tools: &ToolLocator) -> InfoFetcher {
    let yt_dlp_path = tools
        .find(Tool::YtDlp)
        .unwrap_or_else(|| PathBuf::from(Tool::YtDlp.binary_name()));

    let mut cfg = YtDlpConfig::new(yt_dlp_path);
    cfg.metadata_timeout = settings.info_timeout();
    InfoFetcher::new(cfg)
}
