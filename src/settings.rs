//! Settings
//!
//! User preferences persisted as a JSON file in the platform config
//! directory. Missing or partial files fall back to defaults field by field.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::download_manager::DownloadConfig;
use crate::tool_manager::ToolLocator;

/// Environment variable overriding the yt-dlp path.
pub const ENV_YT_DLP: &str = "YTGRAB_YT_DLP";
/// Environment variable overriding the ffmpeg path.
pub const ENV_FFMPEG: &str = "YTGRAB_FFMPEG";

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub tools: ToolSettings,

    #[serde(default)]
    pub download: DownloadSettings,

    #[serde(default)]
    pub timing: TimingSettings,
}

/// Explicit tool locations. `None` means auto-detect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default)]
    pub yt_dlp_path: Option<PathBuf>,

    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    /// Default destination when the caller gives none.
    #[serde(default = "default_download_folder")]
    pub download_folder: PathBuf,

    #[serde(default = "default_concurrent_fragments")]
    pub concurrent_fragments: u32,

    /// Applied to both `--retries` and `--fragment-retries`.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Target format for audio extraction.
    #[serde(default = "default_audio_format")]
    pub audio_format: String,

    #[serde(default = "default_true")]
    pub embed_thumbnail: bool,

    #[serde(default = "default_true")]
    pub embed_metadata: bool,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            download_folder: default_download_folder(),
            concurrent_fragments: default_concurrent_fragments(),
            retries: default_retries(),
            audio_format: default_audio_format(),
            embed_thumbnail: true,
            embed_metadata: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Delay between polite and forced termination on cancel (capped at 5s).
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    #[serde(default = "default_info_timeout_secs")]
    pub info_timeout_secs: u64,

    /// Debounce window for metadata lookups driven by typing.
    #[serde(default = "default_info_debounce_ms")]
    pub info_debounce_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            kill_grace_ms: default_kill_grace_ms(),
            info_timeout_secs: default_info_timeout_secs(),
            info_debounce_ms: default_info_debounce_ms(),
        }
    }
}

// Default value functions
fn default_download_folder() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_concurrent_fragments() -> u32 {
    4
}

fn default_retries() -> u32 {
    10
}

fn default_audio_format() -> String {
    "mp3".to_string()
}

fn default_true() -> bool {
    true
}

fn default_kill_grace_ms() -> u64 {
    500
}

fn default_info_timeout_secs() -> u64 {
    30
}

fn default_info_debounce_ms() -> u64 {
    400
}

/// `<config dir>/settings.json`, or `None` when the platform has no home
/// directory.
pub fn settings_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "ytgrab", "ytgrab").map(|d| d.config_dir().join(SETTINGS_FILE))
}

impl Settings {
    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut settings = match settings_path() {
            Some(path) => Self::load_from(&path)?,
            None => {
                log::warn!("No config directory available; using default settings");
                Self::default()
            }
        };
        settings.apply_overrides(|key| std::env::var_os(key).map(PathBuf::from));
        Ok(settings)
    }

    /// Load from `path`. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No settings file at {:?}; using defaults", path);
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))?;
        log::info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;
        Ok(())
    }

    /// Tool paths from the environment take precedence over the file.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<PathBuf>,
    {
        if let Some(p) = lookup(ENV_YT_DLP).filter(|p| !p.as_os_str().is_empty()) {
            log::debug!("{} overrides yt-dlp path: {:?}", ENV_YT_DLP, p);
            self.tools.yt_dlp_path = Some(p);
        }
        if let Some(p) = lookup(ENV_FFMPEG).filter(|p| !p.as_os_str().is_empty()) {
            log::debug!("{} overrides ffmpeg path: {:?}", ENV_FFMPEG, p);
            self.tools.ffmpeg_path = Some(p);
        }
    }

    pub fn tool_locator(&self) -> ToolLocator {
        ToolLocator::new(self.tools.yt_dlp_path.clone(), self.tools.ffmpeg_path.clone())
    }

    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            tools: self.tool_locator(),
            global_args: vec![],
            concurrent_fragments: self.download.concurrent_fragments,
            retries: self.download.retries,
            audio_format: self.download.audio_format.clone(),
            embed_thumbnail: self.download.embed_thumbnail,
            embed_metadata: self.download.embed_metadata,
            kill_grace: Duration::from_millis(self.timing.kill_grace_ms),
        }
    }

    pub fn info_timeout(&self) -> Duration {
        Duration::from_secs(self.timing.info_timeout_secs)
    }

    pub fn info_debounce(&self) -> Duration {
        Duration::from_millis(self.timing.info_debounce_ms)
    }
}
