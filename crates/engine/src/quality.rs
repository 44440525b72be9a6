//! Image quality search.
//!
//! Image encoders have no target-size mode, so compression runs an
//! encode-measure-adjust loop over a normalized 0-100 quality.

use crate::job::ImageFormat;

/// Adjustment applied when the output is too large.
pub const QUALITY_STEP_DOWN: i32 = 10;
/// Adjustment applied when the output is too small.
pub const QUALITY_STEP_UP: i32 = 7;
pub const MIN_QUALITY: u32 = 10;
pub const MAX_QUALITY: u32 = 95;

/// Starting quality for the search.
pub fn initial_quality(format: ImageFormat) -> u32 {
    match format {
        ImageFormat::Webp => 80,
        ImageFormat::Jpeg => 85,
    }
}

/// Maps normalized quality onto the encoder's native `-q:v` scale.
///
/// WebP takes 1-100 directly. The MJPEG scale is inverted (2 is best).
pub fn native_quality(format: ImageFormat, quality: u32) -> u32 {
    match format {
        ImageFormat::Webp => quality.clamp(1, 100),
        ImageFormat::Jpeg => mjpeg_qscale(quality),
    }
}

/// `max(2, round((100 - q) / 2))`
pub fn mjpeg_qscale(quality: u32) -> u32 {
    let q = quality.min(100) as f64;
    (((100.0 - q) / 2.0).round() as u32).max(2)
}

/// Progress shown while iterating, since the encoder reports nothing useful.
pub fn synthetic_percent(attempt: u32) -> f64 {
    (20.0 + attempt as f64 * 15.0).min(95.0)
}

/// Decision after measuring one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStep {
    /// Within tolerance: keep this output
    Accept,
    /// Try again with the given quality
    Retry(u32),
    /// Out of attempts: keep the last output anyway
    Exhausted,
}

/// State of one quality search.
#[derive(Debug, Clone)]
pub struct QualitySearch {
    target_bytes: u64,
    tolerance: f64,
    max_attempts: u32,
    quality: u32,
    attempts: u32,
}

impl QualitySearch {
    pub fn new(format: ImageFormat, target_bytes: u64, tolerance: f64, max_attempts: u32) -> Self {
        Self {
            target_bytes: target_bytes.max(1),
            tolerance,
            max_attempts: max_attempts.max(1),
            quality: initial_quality(format),
            attempts: 0,
        }
    }

    /// Quality for the next encode
    pub fn quality(&self) -> u32 {
        self.quality
    }

    /// Encodes made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records the size of the latest encode and decides what to do next.
    pub fn observe(&mut self, actual_bytes: u64) -> SearchStep {
        self.attempts += 1;

        let deviation =
            (actual_bytes as f64 - self.target_bytes as f64).abs() / self.target_bytes as f64;
        if deviation < self.tolerance {
            return SearchStep::Accept;
        }
        if self.attempts >= self.max_attempts {
            return SearchStep::Exhausted;
        }

        let next = if actual_bytes > self.target_bytes {
            self.quality as i32 - QUALITY_STEP_DOWN
        } else {
            self.quality as i32 + QUALITY_STEP_UP
        };
        self.quality = (next.max(0) as u32).clamp(MIN_QUALITY, MAX_QUALITY);
        SearchStep::Retry(self.quality)
    }
}
