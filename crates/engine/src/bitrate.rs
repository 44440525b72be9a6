//! Bitrate allocation for size-targeted encodes.

use crate::config::CompressConfig;

/// Floors and ceilings for allocation, in kbps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitrateLimits {
    pub min_total: u32,
    pub min_video: u32,
    pub min_audio: u32,
    pub max_audio: u32,
    /// Kept back from the total before the audio share is taken
    pub audio_reserve: u32,
    pub default_audio: u32,
}

impl Default for BitrateLimits {
    fn default() -> Self {
        Self::from(&CompressConfig::default())
    }
}

impl From<&CompressConfig> for BitrateLimits {
    fn from(cfg: &CompressConfig) -> Self {
        Self {
            min_total: cfg.min_total_kbps,
            min_video: cfg.min_video_kbps,
            min_audio: cfg.min_audio_kbps,
            max_audio: cfg.max_audio_kbps,
            audio_reserve: cfg.audio_reserve_kbps,
            default_audio: cfg.default_audio_kbps,
        }
    }
}

/// Bitrate split for a two-pass video encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoPlan {
    pub total_kbps: u32,
    pub video_kbps: u32,
    pub audio_kbps: u32,
}

/// `max(min_total, floor(target_bytes * 8 / duration / 1000))`
///
/// Returns None for a non-positive or non-finite duration.
pub fn target_total_kbps(target_bytes: u64, duration_secs: f64, limits: &BitrateLimits) -> Option<u32> {
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return None;
    }
    let kbps = (target_bytes as f64 * 8.0 / duration_secs / 1000.0).floor();
    let kbps = if kbps >= u32::MAX as f64 { u32::MAX } else { kbps as u32 };
    Some(kbps.max(limits.min_total))
}

/// Audio-only output: the whole budget, clamped to the audio range.
pub fn plan_audio(total_kbps: u32, limits: &BitrateLimits) -> u32 {
    total_kbps.clamp(limits.min_audio, limits.max_audio.max(limits.min_audio))
}

/// Splits the budget between audio and video.
///
/// Audio gets the requested rate (or the default), capped by the ceiling and
/// by what is left after the reserve, and never below the audio floor. Video
/// gets the remainder, never below the video floor.
pub fn plan_video(total_kbps: u32, requested_audio: Option<u32>, limits: &BitrateLimits) -> VideoPlan {
    let requested = requested_audio.unwrap_or(limits.default_audio);
    let audio_kbps = requested
        .min(limits.max_audio)
        .min(total_kbps.saturating_sub(limits.audio_reserve))
        .max(limits.min_audio);
    let video_kbps = total_kbps.saturating_sub(audio_kbps).max(limits.min_video);

    VideoPlan {
        total_kbps,
        video_kbps,
        audio_kbps,
    }
}

/// Resolves a compress target to bytes.
///
/// Percent mode rounds to whole megabytes with a floor of 1 MB.
pub fn target_megabytes(input_bytes: u64, target: crate::job::CompressTarget) -> f64 {
    match target {
        crate::job::CompressTarget::SizeMb(mb) => mb,
        crate::job::CompressTarget::Percent(pct) => {
            let input_mb = input_bytes as f64 / (1024.0 * 1024.0);
            (input_mb * pct / 100.0).round().max(1.0)
        }
    }
}

pub fn megabytes_to_bytes(mb: f64) -> u64 {
    (mb * 1024.0 * 1024.0).max(0.0) as u64
}
