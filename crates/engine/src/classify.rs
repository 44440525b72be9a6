//! Classifier module for categorizing inputs by media kind.
//!
//! Classification is extension based. Anything not recognised as an image
//! or audio file is treated as video and left for the prober to reject.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Broad category of a media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Image => write!(f, "image"),
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Extensions handled by the image encoders.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "bmp", "tif", "tiff", "gif", "webp", "heic", "heif",
];

/// Extensions handled by the audio encoders.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "aac", "m4a", "flac", "ogg", "opus"];

/// Container targets a convert job may write video into.
pub const VIDEO_CONTAINERS: &[&str] = &["mp4", "mkv", "mov", "webm", "gif"];

/// Lowercased extension of `path` without the dot, or an empty string.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Classifies a bare extension (case-insensitive, leading dot tolerated).
pub fn classify_extension(ext: &str) -> MediaKind {
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        MediaKind::Image
    } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        MediaKind::Audio
    } else {
        MediaKind::Video
    }
}

/// Classifies a file path by its extension.
pub fn classify_path(path: &Path) -> MediaKind {
    classify_extension(&extension_of(path))
}

/// Returns true when `ext` names a container a convert job can write video into.
pub fn is_video_container(ext: &str) -> bool {
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();
    VIDEO_CONTAINERS.contains(&ext.as_str())
}
