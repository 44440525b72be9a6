//! Concurrency planning module
//!
//! Derives the per-queue admission ceilings from the CPU core count and configuration.

use crate::config::QueueConfig;

/// Ceiling used for the download queue when none is configured.
///
/// Downloads are network bound, so the core count is not a useful signal.
pub const DEFAULT_DOWNLOAD_CONCURRENCY: u32 = 3;

const MAX_COMPRESS_CONCURRENCY: u32 = 5;
const MAX_CONVERT_CONCURRENCY: u32 = 3;

/// Admission ceilings for the three queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Total logical CPU cores the plan was derived from
    pub total_cores: u32,
    pub download: usize,
    pub compress: usize,
    pub convert: usize,
}

impl QueueLimits {
    /// Derive queue limits from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Explicit non-zero ceilings are used unchanged
    /// - download: 3
    /// - compress: cores / 2, clamped to [1, 5]
    /// - convert: cores / 4, clamped to [1, 3]
    pub fn derive(cfg: &QueueConfig) -> Self {
        let total_cores = cfg
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32)
            .max(1);

        let download = explicit_or(cfg.download_concurrency, DEFAULT_DOWNLOAD_CONCURRENCY);
        let compress = explicit_or(
            cfg.compress_concurrency,
            (total_cores / 2).clamp(1, MAX_COMPRESS_CONCURRENCY),
        );
        let convert = explicit_or(
            cfg.convert_concurrency,
            (total_cores / 4).clamp(1, MAX_CONVERT_CONCURRENCY),
        );

        Self {
            total_cores,
            download: download as usize,
            compress: compress as usize,
            convert: convert as usize,
        }
    }
}

fn explicit_or(explicit: u32, derived: u32) -> u32 {
    if explicit > 0 {
        explicit
    } else {
        derived
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_limits_derived_from_cores(cores in 1u32..256) {
            let cfg = QueueConfig {
                logical_cores: Some(cores),
                ..QueueConfig::default()
            };

            let limits = QueueLimits::derive(&cfg);

            prop_assert_eq!(limits.total_cores, cores);
            prop_assert_eq!(limits.download, 3);
            prop_assert!(limits.compress >= 1 && limits.compress <= 5);
            prop_assert!(limits.convert >= 1 && limits.convert <= 3);
            prop_assert_eq!(limits.compress as u32, (cores / 2).clamp(1, 5));
            prop_assert_eq!(limits.convert as u32, (cores / 4).clamp(1, 3));
        }

        #[test]
        fn prop_explicit_limits_override(
            cores in 1u32..256,
            download in 1u32..64,
            compress in 1u32..64,
            convert in 1u32..64,
        ) {
            let cfg = QueueConfig {
                download_concurrency: download,
                compress_concurrency: compress,
                convert_concurrency: convert,
                logical_cores: Some(cores),
            };

            let limits = QueueLimits::derive(&cfg);

            prop_assert_eq!(limits.download, download as usize);
            prop_assert_eq!(limits.compress, compress as usize);
            prop_assert_eq!(limits.convert, convert as usize);
        }
    }

    #[test]
    fn test_zero_cores_treated_as_one() {
        let cfg = QueueConfig {
            logical_cores: Some(0),
            ..QueueConfig::default()
        };
        let limits = QueueLimits::derive(&cfg);
        assert_eq!(limits.total_cores, 1);
        assert_eq!(limits.compress, 1);
        assert_eq!(limits.convert, 1);
    }

    #[test]
    fn test_common_core_counts() {
        let limits = QueueLimits::derive(&QueueConfig {
            logical_cores: Some(16),
            ..QueueConfig::default()
        });
        assert_eq!((limits.download, limits.compress, limits.convert), (3, 5, 3));

        let limits = QueueLimits::derive(&QueueConfig {
            logical_cores: Some(4),
            ..QueueConfig::default()
        });
        assert_eq!((limits.download, limits.compress, limits.convert), (3, 2, 1));
    }
}
