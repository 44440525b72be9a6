//! CLI entry point for mediaflow
//!
//! Submits download, compress and convert jobs to the engine and streams
//! every progress event to stdout as one JSON object per line.

use clap::{Parser, Subcommand};
use mediaflow_engine::{
    probe_file, run_preflight, BinaryResolver, CompressRequest, CompressTarget, Config,
    ConfiguredResolver, ConvertRequest, DownloadRequest, ImageFormat, JobId, JobRequest, LogSink,
    MediaEngine, MediaType, QualityTier, Stage, Tool,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// How long to wait for canceled jobs to clean up before exiting.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// mediaflow - download, compress and convert media with yt-dlp and ffmpeg
#[derive(Parser, Debug)]
#[command(name = "mediaflow")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (optional)
    #[arg(short, long, default_value = "mediaflow.toml", global = true)]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download one or more URLs
    Download {
        #[arg(required = true)]
        urls: Vec<String>,

        /// Extract audio (m4a) instead of video
        #[arg(long)]
        audio: bool,

        /// best, 8k, 4k, 2k, 1080p, 720p, 480p, 360p or 240p
        #[arg(short, long, default_value = "best")]
        quality: QualityTier,

        /// Output directory
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Compress files toward a target size
    Compress {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Target size in megabytes
        #[arg(long, conflicts_with = "percent", required_unless_present = "percent")]
        size_mb: Option<f64>,

        /// Target size as a percentage of the input
        #[arg(long)]
        percent: Option<f64>,

        /// Output format for images: jpeg or webp
        #[arg(long, default_value = "jpeg")]
        image_format: ImageFormat,

        /// Audio bitrate for video outputs
        #[arg(long)]
        audio_kbps: Option<u32>,

        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Convert files to another format
    Convert {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Target extension, e.g. mp4, mp3, webp
        #[arg(long)]
        to: String,

        #[arg(long)]
        crf: Option<u32>,

        #[arg(long)]
        audio_kbps: Option<u32>,

        /// Image quality, 1-100
        #[arg(long)]
        image_quality: Option<u32>,

        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Print what the prober reports about a local file
    Probe { file: PathBuf },

    /// Check that yt-dlp, ffmpeg and ffprobe are usable
    Doctor,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Turns a job subcommand into requests, one per input.
fn job_requests(command: Commands) -> Vec<JobRequest> {
    match command {
        Commands::Download { urls, audio, quality, out } => urls
            .into_iter()
            .map(|url| {
                let mut request = DownloadRequest::new(url);
                request.media_type = if audio { MediaType::Audio } else { MediaType::Video };
                request.quality = quality;
                request.output_dir = out.clone();
                JobRequest::Download(request)
            })
            .collect(),
        Commands::Compress { inputs, size_mb, percent, image_format, audio_kbps, out } => {
            let target = match (size_mb, percent) {
                (Some(mb), _) => CompressTarget::SizeMb(mb),
                (None, Some(pct)) => CompressTarget::Percent(pct),
                (None, None) => return Vec::new(),
            };
            inputs
                .into_iter()
                .map(|input| {
                    let mut request = CompressRequest::new(input, target);
                    request.image_format = image_format;
                    request.audio_kbps = audio_kbps;
                    request.output_dir = out.clone();
                    JobRequest::Compress(request)
                })
                .collect()
        }
        Commands::Convert { inputs, to, crf, audio_kbps, image_quality, out } => inputs
            .into_iter()
            .map(|input| {
                let mut request = ConvertRequest::new(input, to.clone());
                request.crf = crf;
                request.audio_kbps = audio_kbps;
                request.image_quality = image_quality;
                request.output_dir = out.clone();
                JobRequest::Convert(request)
            })
            .collect(),
        Commands::Probe { .. } | Commands::Doctor => Vec::new(),
    }
}

/// Runs the jobs to completion, printing events. Fails if any job did not finish.
async fn run_jobs(config: Config, requests: Vec<JobRequest>) -> ExitCode {
    let engine = match MediaEngine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Failed to start engine: {}", e);
            return ExitCode::FAILURE;
        }
    };
    engine.add_sink(Arc::new(LogSink));
    let mut events = engine.subscribe();

    let ids: HashSet<JobId> = requests.into_iter().map(|r| engine.submit(r)).collect();
    let mut remaining = ids.len();
    let mut unsuccessful = 0usize;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    while remaining > 0 {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                let canceled = engine.cancel_all();
                tracing::warn!(canceled, "interrupted, canceling jobs");
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
                }
                if event.is_terminal() && ids.contains(&event.job_id) {
                    remaining -= 1;
                    if event.stage != Stage::Done {
                        unsuccessful += 1;
                    }
                }
            }
        }
    }

    // Canceled jobs still remove their partial files after the terminal event
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while !engine.is_idle() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    if unsuccessful > 0 || remaining > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn doctor(config: &Config) -> ExitCode {
    let resolver = ConfiguredResolver::new(config.tools.clone());
    let statuses = run_preflight(&resolver);

    for status in &statuses {
        match (&status.version, &status.error) {
            (Some(version), _) => {
                let path = status
                    .path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                println!("{:<8} ok       {} ({})", status.tool.to_string(), version, path);
            }
            (None, error) => println!(
                "{:<8} MISSING  {}",
                status.tool.to_string(),
                error.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    if statuses.iter().all(|s| s.is_ok()) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn probe(config: &Config, file: &Path) -> ExitCode {
    let resolver = ConfiguredResolver::new(config.tools.clone());
    let prober = match resolver.resolve(Tool::Prober) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match probe_file(&prober, file) {
        Ok(result) => match serde_json::to_string_pretty(&result) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to serialize probe result: {}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Probe of {} failed: {}", file.display(), e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    match args.command {
        Commands::Doctor => doctor(&config),
        Commands::Probe { file } => probe(&config, &file),
        command => run_jobs(config, job_requests(command)).await,
    }
}
