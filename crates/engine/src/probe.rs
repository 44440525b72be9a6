//! Media probing.
//!
//! Local files are probed with ffprobe's JSON output; remote URLs with the
//! fetcher's single-video JSON dump. Both parse into immutable results.

use crate::runner::{run_capture, ProcessTracker, RunError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The prober could not be run or exited with an error.
    #[error("probe failed: {0}")]
    Run(#[from] RunError),

    /// ffprobe exited with a failure status (synchronous probe).
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse the JSON output.
    #[error("Failed to parse probe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Information about a video stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoStream {
    /// Codec name (e.g., "hevc", "h264", "vp9").
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    /// Bitrate in kbps (if available).
    pub bitrate_kbps: Option<f32>,
}

/// Information about an audio stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioStream {
    pub codec_name: String,
    pub channels: u32,
}

/// Container-level information.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatInfo {
    /// Duration in seconds, 0 when unknown.
    pub duration_secs: f64,
    pub size_bytes: u64,
    /// Container name as ffprobe reports it (e.g. "mov,mp4,m4a,3gp,3g2,mj2").
    pub format_name: String,
}

/// Result of probing a media file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeResult {
    pub video_streams: Vec<VideoStream>,
    pub audio_streams: Vec<AudioStream>,
    pub format: FormatInfo,
}

impl ProbeResult {
    /// Positive, finite duration, or None.
    pub fn duration(&self) -> Option<f64> {
        let d = self.format.duration_secs;
        (d.is_finite() && d > 0.0).then_some(d)
    }

    /// `WIDTHxHEIGHT` of the first video stream.
    pub fn resolution(&self) -> Option<String> {
        self.video_streams
            .first()
            .filter(|v| v.width > 0 && v.height > 0)
            .map(|v| format!("{}x{}", v.width, v.height))
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
        pub channels: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
        pub format_name: Option<String>,
    }
}

/// `ffprobe -v quiet -print_format json -show_streams -show_format <path>`
pub fn probe_command(program: &Path, path: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.args([
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_streams",
        "-show_format",
    ])
    .arg(path);
    cmd
}

/// Probes a file as part of a job; the prober is tracked for cancellation.
pub async fn probe_media(
    tracker: &dyn ProcessTracker,
    program: &Path,
    path: &Path,
) -> Result<ProbeResult, ProbeError> {
    let stdout = run_capture(tracker, probe_command(program, path).into()).await?;
    parse_ffprobe_output(&stdout)
}

/// Probes a file outside of any job, blocking the caller.
pub fn probe_file(program: &Path, path: &Path) -> Result<ProbeResult, ProbeError> {
    let output = probe_command(program, path).output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_output(&stdout)
}

/// Parses ffprobe JSON output into a ProbeResult.
pub fn parse_ffprobe_output(json_str: &str) -> Result<ProbeResult, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let mut video_streams = Vec::new();
    let mut audio_streams = Vec::new();

    for stream in streams {
        let codec_name = stream.codec_name.clone().unwrap_or_default();
        match stream.codec_type.as_deref().unwrap_or("") {
            "video" => {
                let bitrate_kbps = stream
                    .bit_rate
                    .as_ref()
                    .and_then(|br| br.parse::<f64>().ok())
                    .map(|bps| (bps / 1000.0) as f32);

                video_streams.push(VideoStream {
                    codec_name,
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                    bitrate_kbps,
                });
            }
            "audio" => audio_streams.push(AudioStream {
                codec_name,
                channels: stream.channels.unwrap_or(0),
            }),
            _ => {}
        }
    }

    let duration_secs = format
        .duration
        .as_ref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    let size_bytes = format
        .size
        .as_ref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(ProbeResult {
        video_streams,
        audio_streams,
        format: FormatInfo {
            duration_secs,
            size_bytes,
            format_name: format.format_name.unwrap_or_default(),
        },
    })
}

/// Metadata the fetcher reports for a URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteMeta {
    pub id: Option<String>,
    pub title: Option<String>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    /// `WIDTHxHEIGHT` or `NNNp`
    pub resolution: Option<String>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub duration: Option<f64>,
    /// Best (last listed) thumbnail URL
    pub thumbnail: Option<String>,
}

mod ytdlp_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct Info {
        pub id: Option<String>,
        pub title: Option<String>,
        pub ext: Option<String>,
        pub vcodec: Option<String>,
        pub acodec: Option<String>,
        pub resolution: Option<String>,
        pub height: Option<f64>,
        pub fps: Option<f64>,
        pub duration: Option<f64>,
        pub thumbnail: Option<String>,
        #[serde(default)]
        pub thumbnails: Vec<Thumbnail>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Thumbnail {
        pub url: Option<String>,
    }
}

/// Parses the fetcher's `-j` output (first JSON document only).
pub fn parse_remote_meta(json_str: &str) -> Result<RemoteMeta, ProbeError> {
    let start = json_str
        .find('{')
        .ok_or_else(|| ProbeError::ParseError("no JSON object in fetcher output".to_string()))?;
    let info: ytdlp_json::Info = serde_json::Deserializer::from_str(&json_str[start..])
        .into_iter::<ytdlp_json::Info>()
        .next()
        .ok_or_else(|| ProbeError::ParseError("empty fetcher output".to_string()))?
        .map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let height = info
        .height
        .filter(|h| *h > 0.0)
        .map(|h| h as u32)
        .or_else(|| info.resolution.as_deref().and_then(parse_height));
    let resolution = info
        .resolution
        .filter(|r| parse_height(r).is_some())
        .or_else(|| height.map(|h| format!("{}p", h)));
    let thumbnail = info
        .thumbnails
        .iter()
        .rev()
        .find_map(|t| t.url.clone())
        .or(info.thumbnail);

    Ok(RemoteMeta {
        id: info.id,
        title: info.title.filter(|t| !t.trim().is_empty()),
        ext: info.ext,
        vcodec: info.vcodec.filter(|c| c != "none"),
        acodec: info.acodec.filter(|c| c != "none"),
        resolution,
        height,
        fps: info.fps,
        duration: info.duration.filter(|d| *d > 0.0),
        thumbnail,
    })
}

/// Height from `1920x1080` or `1080p`.
pub fn parse_height(resolution: &str) -> Option<u32> {
    let r = resolution.trim().to_ascii_lowercase();
    if let Some((w, h)) = r.split_once('x') {
        if w.parse::<u32>().is_ok() {
            return h.parse().ok();
        }
        return None;
    }
    r.strip_suffix('p').and_then(|h| h.parse().ok())
}
