//! Fetcher command builders and format selection.

use crate::job::{MediaType, QualityTier};
use crate::parser::DOWNLOAD_PROGRESS_TAG;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Heights at or below this prefer H.264 in an MP4 container.
const H264_PREFERRED_MAX_HEIGHT: u32 = 1080;

/// Fields requested through `--progress-template`, `|`-separated.
const PROGRESS_FIELDS: &str = "%(progress._percent_str)s|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress._speed_str)s|%(progress._eta_str)s";

/// Parameters for a fetch.
#[derive(Debug, Clone)]
pub struct FetchParams {
    pub url: String,
    pub output: PathBuf,
    pub media_type: MediaType,
    pub quality: QualityTier,
    /// Source height from the metadata probe, used by `best`
    pub source_height: Option<u32>,
    /// Directory or binary the fetcher should use for merging
    pub ffmpeg_location: Option<PathBuf>,
    pub concurrent_fragments: u32,
}

/// MP4/H.264-preferring selector capped at `height`.
///
/// Falls back to any non-AV1 MP4 video, then to a progressive MP4.
pub fn h264_capped_selector(height: u32) -> String {
    format!(
        "bv*[height<={h}][vcodec^=avc1][ext=mp4]+ba[acodec^=mp4a]/bv*[height<={h}][vcodec!^=av01][ext=mp4]+ba/b[height<={h}][ext=mp4]",
        h = height
    )
}

/// `-f` selector for a request.
pub fn format_selector(media_type: MediaType, quality: QualityTier, source_height: Option<u32>) -> String {
    if media_type == MediaType::Audio {
        return "bestaudio/best".to_string();
    }
    match quality.height() {
        Some(h) if quality.is_high_resolution() => format!("bestvideo[height>={}]+bestaudio/best", h),
        Some(h) => h264_capped_selector(h),
        None => match source_height {
            Some(h) if h <= H264_PREFERRED_MAX_HEIGHT => h264_capped_selector(H264_PREFERRED_MAX_HEIGHT),
            _ => "bestvideo+bestaudio/best".to_string(),
        },
    }
}

/// Whether a finished video needs a follow-up H.264 transcode.
///
/// Only videos at or below `max_height` whose codec is not already H.264 qualify.
pub fn needs_recode(media_type: MediaType, height: Option<u32>, vcodec: Option<&str>, max_height: u32) -> bool {
    if media_type != MediaType::Video {
        return false;
    }
    let Some(height) = height else {
        return false;
    };
    if height == 0 || height > max_height {
        return false;
    }
    match vcodec.map(|c| c.to_ascii_lowercase()) {
        Some(codec) if codec == "none" => false,
        Some(codec) => !(codec.starts_with("avc1") || codec.starts_with("h264")),
        None => false,
    }
}

/// Fetcher command with UTF-8 forced on its Python runtime.
fn base(program: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.env("PYTHONIOENCODING", "utf-8");
    cmd.env("PYTHONUTF8", "1");
    cmd
}

/// Single-video metadata dump (`-j`).
pub fn metadata_command(program: &Path, url: &str) -> Command {
    let mut cmd = base(program);
    cmd.args(["-j", "--no-playlist", "--no-warnings", "--skip-download"]);
    cmd.arg(url);
    cmd
}

/// Download command writing exactly to `params.output`.
pub fn fetch_command(program: &Path, params: &FetchParams) -> Command {
    let mut cmd = base(program);
    cmd.arg("-N").arg(params.concurrent_fragments.max(1).to_string());
    if let Some(location) = &params.ffmpeg_location {
        cmd.arg("--ffmpeg-location").arg(location);
    }
    cmd.args([
        "--no-playlist",
        "--no-warnings",
        "--progress",
        "--newline",
        "--no-color",
        "--force-overwrites",
        "--no-continue",
        "--no-keep-fragments",
    ]);
    cmd.arg("--progress-template")
        .arg(format!("download:{} {}", DOWNLOAD_PROGRESS_TAG, PROGRESS_FIELDS));
    cmd.arg("-f").arg(format_selector(
        params.media_type,
        params.quality,
        params.source_height,
    ));
    match params.media_type {
        MediaType::Audio => {
            cmd.args(["-x", "--audio-format", "m4a"]);
        }
        MediaType::Video => {
            cmd.args(["--merge-output-format", "mp4", "--remux-video", "mp4"]);
        }
    }
    cmd.arg("-o").arg(&params.output);
    cmd.arg(&params.url);
    cmd
}
