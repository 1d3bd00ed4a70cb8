use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ytgrab::tool_manager::{ToolInfo, ToolStatus};
use ytgrab::url_utils;
use ytgrab::{Core, DownloadRequest, MediaFormat, SessionEvent, Settings};

// --- CLI ---

#[derive(Parser, Debug)]
#[command(author, version = env!("CARGO_PKG_VERSION"), about = "Download YouTube videos and audio through yt-dlp", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show title, duration and thumbnail of a video
    Info {
        url: String,

        /// Print the metadata as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download a video (MP4) or its audio track
    Download {
        url: String,

        /// Extract audio instead of keeping the video
        #[arg(short, long)]
        audio: bool,

        /// Audio bitrate in kbps (e.g. 192) or video height (e.g. 720, best)
        #[arg(short, long)]
        quality: Option<String>,

        /// Destination directory (default: configured download folder)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Output file name without extension (default: video title)
        #[arg(short = 'o', long)]
        filename: Option<String>,

        /// Print every event as a JSON line
        #[arg(long)]
        json: bool,
    },

    /// Check that yt-dlp and ffmpeg are installed and working
    Tools {
        #[arg(long)]
        json: bool,
    },
}

/// Exit status for a cancelled download (128 + SIGINT).
const EXIT_CANCELLED: u8 = 130;
/// Exit status when a request is rejected before anything runs.
const EXIT_REJECTED: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let settings = Settings::load().context("Failed to load settings")?;
    let (core, events) = Core::new(settings);

    match args.command {
        Command::Info { url, json } => info(&core, &url, json).await,
        Command::Download {
            url,
            audio,
            quality,
            dir,
            filename,
            json,
        } => {
            let format = if audio {
                MediaFormat::AudioOnly
            } else {
                MediaFormat::VideoContainer
            };
            let request = DownloadRequest {
                source_url: url_utils::first_url(&url).unwrap_or(&url).to_string(),
                format,
                quality_token: quality.unwrap_or_else(|| default_quality(format).to_string()),
                destination_directory: dir.unwrap_or_else(|| core.default_destination()),
                desired_filename: filename,
            };
            download(&core, events, request, json).await
        }
        Command::Tools { json } => tools(&core, json).await,
    }
}

fn default_quality(format: MediaFormat) -> &'static str {
    match format {
        MediaFormat::AudioOnly => "192",
        MediaFormat::VideoContainer => "best",
    }
}

async fn info(core: &Core, url: &str, json: bool) -> Result<ExitCode> {
    let Some(meta) = core.get_info(url).await else {
        eprintln!("Could not fetch metadata for {url}");
        return Ok(ExitCode::FAILURE);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&meta)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("{}", meta.title);
    if let Some(ref uploader) = meta.uploader {
        println!("  by {uploader}");
    }
    if let Some(secs) = meta.duration_seconds {
        println!("  duration  {}", format_duration(secs));
    }
    if !meta.thumbnail_url.is_empty() {
        println!("  thumbnail {}", meta.thumbnail_url);
    }
    Ok(ExitCode::SUCCESS)
}

async fn download(
    core: &Core,
    mut events: ytgrab::EventReceiver,
    request: DownloadRequest,
    json: bool,
) -> Result<ExitCode> {
    let url = request.source_url.clone();
    if let Err(e) = core.download(request).await {
        // The matching Error event is still queued; print it for --json
        // consumers so they see the same stream either way.
        if json {
            while let Ok(ev) = events.try_recv() {
                println!("{}", serde_json::to_string(&ev)?);
            }
        } else {
            eprintln!("error: {e}");
        }
        return Ok(ExitCode::from(EXIT_REJECTED));
    }

    let mut cancel_requested = false;
    let code = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                if !json {
                    eprintln!("\nCancelling...");
                }
                core.cancel_download().await;
            }
            ev = events.recv() => {
                let Some(ev) = ev else {
                    log::error!("Event channel closed before the download finished");
                    break ExitCode::FAILURE;
                };
                if json {
                    println!("{}", serde_json::to_string(&ev)?);
                } else {
                    print_event(&ev, &url)?;
                }
                match ev {
                    SessionEvent::Done { .. } => break ExitCode::SUCCESS,
                    SessionEvent::Cancelled { .. } => break ExitCode::from(EXIT_CANCELLED),
                    SessionEvent::Error { .. } => break ExitCode::FAILURE,
                    _ => {}
                }
            }
        }
    };
    Ok(code)
}

fn print_event(ev: &SessionEvent, url: &str) -> Result<()> {
    let mut out = std::io::stdout().lock();
    match ev {
        SessionEvent::Started { .. } => writeln!(out, "Downloading {url}")?,
        SessionEvent::Progress { progress, .. } => {
            write!(out, "\r{:5.1}%", progress.percent_complete)?;
            if let Some(ref rate) = progress.transfer_rate {
                write!(out, "  {rate:>11}")?;
            }
            if let Some(ref eta) = progress.estimated_time_remaining {
                write!(out, "  ETA {eta}")?;
            }
            out.flush()?;
        }
        SessionEvent::PostProcessing { step, .. } => writeln!(out, "\n{step}...")?,
        SessionEvent::Done { final_path, .. } => match final_path {
            Some(p) => writeln!(out, "\nSaved to {}", p.display())?,
            None => writeln!(out, "\nDone")?,
        },
        SessionEvent::Error {
            error_code, message, ..
        } => {
            writeln!(out)?;
            eprintln!("{message} ({error_code:?})");
        }
        SessionEvent::Cancelled { .. } => writeln!(out, "\nCancelled")?,
    }
    Ok(())
}

async fn tools(core: &Core, json: bool) -> Result<ExitCode> {
    let status = core.toolchain_status().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_tool(&status.yt_dlp);
        print_tool(&status.ffmpeg);
    }
    Ok(if status.overall_status == ToolStatus::Ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_tool(info: &ToolInfo) {
    let path = info
        .path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".to_string());
    let version = info.version.as_deref().unwrap_or("-");
    println!("{:<7} {:<8} {:<12} {}", info.tool.as_str(), format!("{:?}", info.status).to_lowercase(), version, path);
}

fn format_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}
