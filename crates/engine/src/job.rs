//! Job identity, lifecycle states and the typed request payloads.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque job identifier, unique per submission and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Which queue a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Download,
    Compress,
    Convert,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Download => "download",
            JobKind::Compress => "compress",
            JobKind::Convert => "convert",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle state
///
/// `Queued -> Running -> {Done | Errored | Canceled}`, or `Queued -> Canceled`.
/// A terminal state is never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Errored,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Errored | JobState::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Errored => "errored",
            JobState::Canceled => "canceled",
        }
    }
}

/// What a download job keeps from the remote media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Video,
    Audio,
}

/// Requested download quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QualityTier {
    #[default]
    #[serde(rename = "best")]
    Best,
    #[serde(rename = "8k")]
    Uhd8k,
    #[serde(rename = "4k")]
    Uhd4k,
    #[serde(rename = "2k")]
    Qhd2k,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "240p")]
    P240,
}

impl QualityTier {
    /// Frame height the tier names, or None for `best`.
    pub fn height(&self) -> Option<u32> {
        match self {
            QualityTier::Best => None,
            QualityTier::Uhd8k => Some(4320),
            QualityTier::Uhd4k => Some(2160),
            QualityTier::Qhd2k => Some(1440),
            QualityTier::P1080 => Some(1080),
            QualityTier::P720 => Some(720),
            QualityTier::P480 => Some(480),
            QualityTier::P360 => Some(360),
            QualityTier::P240 => Some(240),
        }
    }

    /// Tiers above 1080p select by minimum height and accept any codec.
    pub fn is_high_resolution(&self) -> bool {
        matches!(self, QualityTier::Uhd8k | QualityTier::Uhd4k | QualityTier::Qhd2k)
    }
}

impl FromStr for QualityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best" => Ok(QualityTier::Best),
            "8k" | "4320p" => Ok(QualityTier::Uhd8k),
            "4k" | "2160p" => Ok(QualityTier::Uhd4k),
            "2k" | "1440p" => Ok(QualityTier::Qhd2k),
            "1080p" | "1080" => Ok(QualityTier::P1080),
            "720p" | "720" => Ok(QualityTier::P720),
            "480p" | "480" => Ok(QualityTier::P480),
            "360p" | "360" => Ok(QualityTier::P360),
            "240p" | "240" => Ok(QualityTier::P240),
            other => Err(format!("unknown quality tier: {}", other)),
        }
    }
}

/// Download a single URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default)]
    pub media_type: MediaType,
    #[serde(default)]
    pub quality: QualityTier,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            media_type: MediaType::Video,
            quality: QualityTier::Best,
            output_dir: None,
        }
    }
}

/// Size goal for a compress job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressTarget {
    /// Absolute target size in megabytes
    SizeMb(f64),
    /// Target as a percentage of the input size
    Percent(f64),
}

/// Output format for image compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Jpeg,
    Webp,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Webp => "webp",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
            "webp" => Ok(ImageFormat::Webp),
            other => Err(format!("unsupported image format: {}", other)),
        }
    }
}

/// Compress a local file toward a target size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressRequest {
    pub input: PathBuf,
    pub target: CompressTarget,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub image_format: ImageFormat,
    /// Requested audio bitrate for video outputs (kbps)
    #[serde(default)]
    pub audio_kbps: Option<u32>,
}

impl CompressRequest {
    pub fn new(input: impl Into<PathBuf>, target: CompressTarget) -> Self {
        Self {
            input: input.into(),
            target,
            output_dir: None,
            image_format: ImageFormat::Jpeg,
            audio_kbps: None,
        }
    }
}

/// Convert a local file into another format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertRequest {
    pub input: PathBuf,
    /// Target extension, without the dot
    pub to: String,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub crf: Option<u32>,
    #[serde(default)]
    pub audio_kbps: Option<u32>,
    /// Normalized image quality, 1..=100
    #[serde(default)]
    pub image_quality: Option<u32>,
}

impl ConvertRequest {
    pub fn new(input: impl Into<PathBuf>, to: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            to: to.into(),
            output_dir: None,
            crf: None,
            audio_kbps: None,
            image_quality: None,
        }
    }

    /// Target extension, lowercased and without a leading dot
    pub fn target_extension(&self) -> String {
        self.to.trim().trim_start_matches('.').to_ascii_lowercase()
    }
}

/// Any job payload, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobRequest {
    Download(DownloadRequest),
    Compress(CompressRequest),
    Convert(ConvertRequest),
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Download(_) => JobKind::Download,
            JobRequest::Compress(_) => JobKind::Compress,
            JobRequest::Convert(_) => JobKind::Convert,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 36);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Errored.is_terminal());
        assert!(JobState::Canceled.is_terminal());
    }

    #[test]
    fn test_quality_tier_parsing() {
        assert_eq!("4K".parse::<QualityTier>().unwrap(), QualityTier::Uhd4k);
        assert_eq!("720p".parse::<QualityTier>().unwrap(), QualityTier::P720);
        assert!("9000p".parse::<QualityTier>().is_err());
        assert_eq!(QualityTier::Best.height(), None);
        assert!(QualityTier::Qhd2k.is_high_resolution());
        assert!(!QualityTier::P1080.is_high_resolution());
    }

    #[test]
    fn test_job_request_json_is_tagged() {
        let request = JobRequest::Convert(ConvertRequest::new("/in/a.mov", ".MP4"));
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["kind"], "convert");
        assert_eq!(request.kind(), JobKind::Convert);

        if let JobRequest::Convert(req) = &request {
            assert_eq!(req.target_extension(), "mp4");
        }
    }

    #[test]
    fn test_compress_target_deserializes() {
        let req: CompressRequest =
            serde_json::from_str(r#"{"input":"/a.png","target":{"percent":40.0}}"#).unwrap();
        assert_eq!(req.target, CompressTarget::Percent(40.0));
        assert_eq!(req.image_format, ImageFormat::Jpeg);
    }
}
