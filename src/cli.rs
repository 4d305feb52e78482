// Lapse Cam CLI binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use lapse_cam_lib::camera::{list_captures, CameraCapture};
use lapse_cam_lib::config::{resolve_config_path, ConfigStore, Settings};
use lapse_cam_lib::encoder::{list_videos, BitrateInput, EncodeRequest, EncoderPhase, EncoderService, ProgressSink};
use lapse_cam_lib::logging;
use lapse_cam_lib::timelapse::format_hms;
use lapse_cam_lib::tools;

#[derive(Parser)]
#[command(name = "lapsecam")]
#[command(about = "Lapse Cam - operator tools for the time-lapse appliance", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file (KEY=VALUE)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture one still into the captures directory
    Capture,

    /// Encode a folder of captures into an MP4
    Encode {
        /// Folder inside the captures directory (defaults to the whole directory)
        #[arg(short, long)]
        input: Option<String>,
        /// Output frame rate
        #[arg(long)]
        fps: Option<f64>,
        /// low, medium or high
        #[arg(long)]
        quality: Option<String>,
        /// h264 or h265
        #[arg(long)]
        codec: Option<String>,
        /// Target bitrate, e.g. 5000k or 5m
        #[arg(long)]
        bitrate: Option<String>,
    },

    /// List captured stills, newest first
    ListCaptures {
        /// Maximum entries to show
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// List finished videos, newest first
    ListVideos,

    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Report which helper executables are available
    CheckTools,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print every setting
    Show,
    /// Set one KEY=VALUE record
    Set {
        /// KEY=VALUE, e.g. CAPTURE_INTERVAL=30
        assignment: String,
    },
    /// Restore defaults, keeping deployment paths
    Reset,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = resolve_config_path(cli.config);
    let store = ConfigStore::load_or_init(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    let settings = store.snapshot();
    logging::init(&settings.log_level, settings.debug_mode);

    match cli.command {
        Commands::Capture => cmd_capture(&settings),
        Commands::Encode {
            input,
            fps,
            quality,
            codec,
            bitrate,
        } => cmd_encode(
            &settings,
            EncodeRequest {
                input_folder: input,
                fps,
                quality,
                codec,
                bitrate: bitrate.map(BitrateInput::Text),
            },
        ),
        Commands::ListCaptures { limit } => cmd_list_captures(&settings, limit),
        Commands::ListVideos => cmd_list_videos(&settings),
        Commands::Config { action } => cmd_config(&store, action),
        Commands::CheckTools => cmd_check_tools(),
    }
}

fn cmd_capture(settings: &Settings) -> Result<()> {
    let camera = CameraCapture::new(&settings.captures_dir, tools::camera_path())?;
    let record = camera.capture(settings)?;
    println!("Captured {}", record.path.display());
    if let Some(res) = record.resolution {
        println!("  Resolution: {}", res);
    }
    println!("  Size:       {}", format_bytes(record.size_bytes));
    Ok(())
}

fn cmd_encode(settings: &Settings, request: EncodeRequest) -> Result<()> {
    let service = EncoderService::new(tools::encoder_path());
    let sink: ProgressSink = Arc::new(|progress| {
        if progress.phase == EncoderPhase::Encoding && progress.percent > 0 {
            eprint!("\rEncoding... {:>3}%", progress.percent);
        } else if !progress.phase.is_terminal() {
            eprintln!("{}", progress.message);
        } else {
            eprintln!();
        }
    });

    let result = service.run_blocking(&request, settings, &sink)?;
    println!("Video created: {}", result.output_path.display());
    println!("  Frames:     {}", result.frame_count);
    println!("  Span:       {}", format_hms(result.duration_seconds));
    println!("  Codec:      {} / {}", result.codec.as_str(), result.quality.as_str());
    println!("  Size:       {}", format_bytes(result.size_bytes));
    println!("  Took:       {:.1}s", result.processing_time_ms as f64 / 1000.0);
    Ok(())
}

fn cmd_list_captures(settings: &Settings, limit: usize) -> Result<()> {
    let captures = list_captures(&settings.captures_dir)?;
    println!("Captures in {} ({} total)", settings.captures_dir.display(), captures.len());
    println!();

    if captures.is_empty() {
        println!("No captures yet. Use 'lapsecam capture' to take one.");
        return Ok(());
    }

    println!("{:<40}  {:>10}  {}", "File", "Size", "Captured (UTC)");
    println!("{}", "-".repeat(75));
    for record in captures.iter().take(limit) {
        println!(
            "{:<40}  {:>10}  {}",
            record.filename,
            format_bytes(record.size_bytes),
            record.captured_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    if captures.len() > limit {
        println!();
        println!("Showing {} of {} captures. Use --limit to see more.", limit, captures.len());
    }
    Ok(())
}

fn cmd_list_videos(settings: &Settings) -> Result<()> {
    let videos = list_videos(&settings.videos_dir)?;
    if videos.is_empty() {
        println!("No videos in {}.", settings.videos_dir.display());
        return Ok(());
    }
    println!("{:<60}  {:>10}", "File", "Size");
    println!("{}", "-".repeat(72));
    for video in videos {
        println!("{:<60}  {:>10}", video.filename, format_bytes(video.size_bytes));
    }
    Ok(())
}

fn cmd_config(store: &ConfigStore, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("# {}", store.path().display());
            for (key, value) in store.snapshot().to_pairs() {
                println!("{}={}", key, value);
            }
        }
        ConfigAction::Set { assignment } => {
            let (key, value) = assignment
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("expected KEY=VALUE, got {}", assignment))?;
            let key = key.trim();
            store.set_record(key, value.trim())?;
            println!("Saved {} to {}", key, store.path().display());
        }
        ConfigAction::Reset => {
            store.reset_to_defaults()?;
            println!("Settings reset to defaults in {}", store.path().display());
        }
    }
    Ok(())
}

fn cmd_check_tools() -> Result<()> {
    let rows = [
        ("camera", tools::camera_path()),
        ("streamer", tools::streamer_path()),
        ("encoder", tools::encoder_path()),
    ];
    let mut missing = 0;
    for (role, path) in rows {
        let ok = tools::is_executable_available(&path);
        if !ok {
            missing += 1;
        }
        println!("{:<9} {:<8} {}", role, if ok { "ok" } else { "MISSING" }, path.display());
    }
    if missing > 0 {
        anyhow::bail!("{} helper(s) missing", missing);
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b >= KB * KB * KB {
        format!("{:.1} GB", b / (KB * KB * KB))
    } else if b >= KB * KB {
        format!("{:.1} MB", b / (KB * KB))
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}
