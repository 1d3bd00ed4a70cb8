use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// What the caller wants out of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaFormat {
    /// Audio extracted into a standalone audio file (mp3 by default).
    AudioOnly,
    /// Video and audio muxed into a single container (mp4).
    VideoContainer,
}

impl MediaFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaFormat::AudioOnly => "audio",
            MediaFormat::VideoContainer => "video",
        }
    }

    /// Interpret a quality token for this format.
    ///
    /// Audio: bitrate in kbps (`192`, `192k`). Video: `best` or a maximum
    /// height (`720`, `720p`).
    pub fn parse_quality(&self, token: &str) -> CoreResult<Quality> {
        let t = token.trim().to_ascii_lowercase();
        let invalid = || CoreError::InvalidQuality {
            token: token.to_string(),
            format: self.as_str(),
        };

        match self {
            MediaFormat::AudioOnly => {
                let digits = t.strip_suffix('k').unwrap_or(&t);
                match digits.parse::<u32>() {
                    Ok(kbps) if kbps > 0 => Ok(Quality::AudioKbps(kbps)),
                    _ => Err(invalid()),
                }
            }
            MediaFormat::VideoContainer => {
                if t == "best" {
                    return Ok(Quality::BestVideo);
                }
                let digits = t.strip_suffix('p').unwrap_or(&t);
                match digits.parse::<u32>() {
                    Ok(h) if h > 0 => Ok(Quality::MaxHeight(h)),
                    _ => Err(invalid()),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    AudioKbps(u32),
    BestVideo,
    MaxHeight(u32),
}

/// A single download as requested by the caller. Consumed once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub source_url: String,
    pub format: MediaFormat,
    /// Bitrate for audio, height or `best` for video.
    pub quality_token: String,
    pub destination_directory: PathBuf,
    #[serde(default)]
    pub desired_filename: Option<String>,
}

impl DownloadRequest {
    /// Desired filename after sanitization, or `None` when the source title
    /// should be used.
    pub fn output_stem(&self) -> Option<String> {
        let raw = self.desired_filename.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        let stem = strip_media_extension(raw);
        let clean = sanitize_output_name(stem);
        if clean.trim_matches('_').is_empty() {
            None
        } else {
            Some(clean)
        }
    }
}

/// Metadata shown before a download starts. Not cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    pub thumbnail_url: String,
    pub duration_seconds: Option<u64>,
    pub uploader: Option<String>,
    pub webpage_url: Option<String>,
}

/// Longest stem we hand to yt-dlp, in bytes. Leaves room under the usual
/// 255-byte file name limit for the extension and yt-dlp's intermediate
/// suffixes (`.f137.mp4.part`).
pub const MAX_STEM_BYTES: usize = 200;

/// Replace every character that cannot appear in a file name (control
/// characters and path-reserved punctuation) with `_`, capped at
/// [`MAX_STEM_BYTES`]. Idempotent.
pub fn sanitize_output_name(name: &str) -> String {
    // Cut before sanitizing so a cut landing on a space or dot is still
    // cleaned up as a trailing character.
    sanitize_filename::sanitize_with_options(
        truncate_utf8(name, MAX_STEM_BYTES),
        sanitize_filename::Options {
            windows: true,
            truncate: false,
            replacement: "_",
        },
    )
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn strip_media_extension(name: &str) -> &str {
    const KNOWN: [&str; 7] = ["mp3", "m4a", "opus", "mp4", "mkv", "webm", "wav"];
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && KNOWN.contains(&ext.to_ascii_lowercase().as_str()) => {
            stem
        }
        _ => name,
    }
}

/// The destination must be an existing, writable directory. Writability is
/// tested by creating (and removing) a scratch file, since permission bits
/// alone say nothing about the current user.
pub fn check_destination(dir: &Path) -> CoreResult<()> {
    match std::fs::metadata(dir) {
        Ok(m) if m.is_dir() => {}
        _ => return Err(CoreError::DestinationMissing(dir.to_path_buf())),
    }

    let scratch = dir.join(format!(".ytgrab-write-test-{}", Uuid::new_v4()));
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&scratch)
    {
        Ok(file) => {
            drop(file);
            if let Err(e) = std::fs::remove_file(&scratch) {
                log::warn!("Failed to remove {:?}: {}", scratch, e);
            }
            Ok(())
        }
        Err(e) => {
            log::debug!("Destination {:?} is not writable: {}", dir, e);
            Err(CoreError::DestinationNotWritable(dir.to_path_buf()))
        }
    }
}
