//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Per-queue concurrency ceilings
///
/// A value of 0 means "derive from the core count".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    #[serde(default)]
    pub download_concurrency: u32,
    #[serde(default)]
    pub compress_concurrency: u32,
    #[serde(default)]
    pub convert_concurrency: u32,
    /// Number of logical cores (auto-detected if None)
    #[serde(default)]
    pub logical_cores: Option<u32>,
}

/// Locations of the external binaries
///
/// Explicit paths win over `bin_dir`, which wins over a `PATH` lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,
    #[serde(default)]
    pub ffmpeg: Option<PathBuf>,
    #[serde(default)]
    pub ffprobe: Option<PathBuf>,
    #[serde(default)]
    pub yt_dlp: Option<PathBuf>,
}

/// Download pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadConfig {
    /// Default output directory when a request names none
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Parallel fragment downloads handed to the fetcher (`-N`)
    #[serde(default = "default_concurrent_fragments")]
    pub concurrent_fragments: u32,
    /// Videos at or below this height are recoded to H.264 when the source codec differs
    #[serde(default = "default_recode_max_height")]
    pub recode_max_height: u32,
}

fn default_concurrent_fragments() -> u32 {
    16
}

fn default_recode_max_height() -> u32 {
    1080
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            concurrent_fragments: default_concurrent_fragments(),
            recode_max_height: default_recode_max_height(),
        }
    }
}

/// Compress pipeline settings: bitrate floors/ceilings and image search tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressConfig {
    #[serde(default = "default_min_total_kbps")]
    pub min_total_kbps: u32,
    #[serde(default = "default_min_video_kbps")]
    pub min_video_kbps: u32,
    #[serde(default = "default_min_audio_kbps")]
    pub min_audio_kbps: u32,
    #[serde(default = "default_max_audio_kbps")]
    pub max_audio_kbps: u32,
    /// Bitrate kept back from the total before the audio share is taken
    #[serde(default = "default_audio_reserve_kbps")]
    pub audio_reserve_kbps: u32,
    #[serde(default = "default_compress_audio_kbps")]
    pub default_audio_kbps: u32,
    /// Accepted relative deviation from the target size (0.08 = 8%)
    #[serde(default = "default_size_tolerance")]
    pub size_tolerance: f64,
    #[serde(default = "default_max_image_attempts")]
    pub max_image_attempts: u32,
}

fn default_min_total_kbps() -> u32 {
    200
}

fn default_min_video_kbps() -> u32 {
    200
}

fn default_min_audio_kbps() -> u32 {
    64
}

fn default_max_audio_kbps() -> u32 {
    320
}

fn default_audio_reserve_kbps() -> u32 {
    64
}

fn default_compress_audio_kbps() -> u32 {
    160
}

fn default_size_tolerance() -> f64 {
    0.08
}

fn default_max_image_attempts() -> u32 {
    5
}

impl Default for CompressConfig {
    fn default() -> Self {
        Self {
            min_total_kbps: default_min_total_kbps(),
            min_video_kbps: default_min_video_kbps(),
            min_audio_kbps: default_min_audio_kbps(),
            max_audio_kbps: default_max_audio_kbps(),
            audio_reserve_kbps: default_audio_reserve_kbps(),
            default_audio_kbps: default_compress_audio_kbps(),
            size_tolerance: default_size_tolerance(),
            max_image_attempts: default_max_image_attempts(),
        }
    }
}

/// Convert pipeline defaults used when a request leaves a knob unset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConvertConfig {
    #[serde(default = "default_crf")]
    pub default_crf: u32,
    #[serde(default = "default_convert_audio_kbps")]
    pub default_audio_kbps: u32,
    #[serde(default = "default_image_quality")]
    pub default_image_quality: u32,
}

fn default_crf() -> u32 {
    22
}

fn default_convert_audio_kbps() -> u32 {
    192
}

fn default_image_quality() -> u32 {
    85
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            default_crf: default_crf(),
            default_audio_kbps: default_convert_audio_kbps(),
            default_image_quality: default_image_quality(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub compress: CompressConfig,
    #[serde(default)]
    pub convert: ConvertConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - MEDIAFLOW_DOWNLOAD_CONCURRENCY -> queues.download_concurrency
    /// - MEDIAFLOW_COMPRESS_CONCURRENCY -> queues.compress_concurrency
    /// - MEDIAFLOW_CONVERT_CONCURRENCY -> queues.convert_concurrency
    /// - MEDIAFLOW_LOGICAL_CORES -> queues.logical_cores
    /// - MEDIAFLOW_BIN_DIR -> tools.bin_dir
    /// - MEDIAFLOW_FFMPEG / MEDIAFLOW_FFPROBE / MEDIAFLOW_YT_DLP -> tools.*
    /// - MEDIAFLOW_OUTPUT_DIR -> download.output_dir
    ///
    /// Unparseable numeric values are ignored; empty path values are ignored.
    pub fn apply_env_overrides(&mut self) {
        override_u32("MEDIAFLOW_DOWNLOAD_CONCURRENCY", &mut self.queues.download_concurrency);
        override_u32("MEDIAFLOW_COMPRESS_CONCURRENCY", &mut self.queues.compress_concurrency);
        override_u32("MEDIAFLOW_CONVERT_CONCURRENCY", &mut self.queues.convert_concurrency);

        if let Ok(val) = env::var("MEDIAFLOW_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.queues.logical_cores = Some(cores);
            }
        }

        override_path("MEDIAFLOW_BIN_DIR", &mut self.tools.bin_dir);
        override_path("MEDIAFLOW_FFMPEG", &mut self.tools.ffmpeg);
        override_path("MEDIAFLOW_FFPROBE", &mut self.tools.ffprobe);
        override_path("MEDIAFLOW_YT_DLP", &mut self.tools.yt_dlp);
        override_path("MEDIAFLOW_OUTPUT_DIR", &mut self.download.output_dir);
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    ///
    /// Any other IO or parse failure is still reported.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Config::default()
            }
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        Ok(config)
    }
}

fn override_u32(var: &str, slot: &mut u32) {
    if let Ok(val) = env::var(var) {
        if let Ok(parsed) = val.trim().parse::<u32>() {
            *slot = parsed;
        }
    }
}

fn override_path(var: &str, slot: &mut Option<PathBuf>) {
    if let Ok(val) = env::var(var) {
        if !val.trim().is_empty() {
            *slot = Some(PathBuf::from(val));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Env var tests must not interleave
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "MEDIAFLOW_DOWNLOAD_CONCURRENCY",
        "MEDIAFLOW_COMPRESS_CONCURRENCY",
        "MEDIAFLOW_CONVERT_CONCURRENCY",
        "MEDIAFLOW_LOGICAL_CORES",
        "MEDIAFLOW_BIN_DIR",
        "MEDIAFLOW_FFMPEG",
        "MEDIAFLOW_FFPROBE",
        "MEDIAFLOW_YT_DLP",
        "MEDIAFLOW_OUTPUT_DIR",
    ];

    fn clear_env_vars() {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            logical_cores in proptest::option::of(1u32..256),
            download in 0u32..16,
            compress in 0u32..16,
            convert in 0u32..16,
            fragments in 1u32..64,
            crf in 0u32..52,
            tolerance in 0.01f64..0.5,
        ) {
            let toml_str = format!(
                r#"
[queues]
{}
download_concurrency = {}
compress_concurrency = {}
convert_concurrency = {}

[tools]
bin_dir = "/opt/media/bin"

[download]
concurrent_fragments = {}

[compress]
size_tolerance = {}

[convert]
default_crf = {}
"#,
                logical_cores.map(|c| format!("logical_cores = {}", c)).unwrap_or_default(),
                download,
                compress,
                convert,
                fragments,
                tolerance,
                crf,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.queues.logical_cores, logical_cores);
            prop_assert_eq!(config.queues.download_concurrency, download);
            prop_assert_eq!(config.queues.compress_concurrency, compress);
            prop_assert_eq!(config.queues.convert_concurrency, convert);
            prop_assert_eq!(config.tools.bin_dir, Some(PathBuf::from("/opt/media/bin")));
            prop_assert_eq!(config.download.concurrent_fragments, fragments);
            prop_assert!((config.compress.size_tolerance - tolerance).abs() < 1e-9);
            prop_assert_eq!(config.convert.default_crf, crf);
            // Untouched keys keep their defaults
            prop_assert_eq!(config.compress.max_image_attempts, 5);
            prop_assert_eq!(config.download.recode_max_height, 1080);
        }

        #[test]
        fn prop_env_overrides_queue_concurrency(
            initial in 0u32..8,
            download in 0u32..32,
            compress in 0u32..32,
            convert in 0u32..32,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[queues]
download_concurrency = {0}
compress_concurrency = {0}
convert_concurrency = {0}
"#,
                initial
            );
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("MEDIAFLOW_DOWNLOAD_CONCURRENCY", download.to_string());
            env::set_var("MEDIAFLOW_COMPRESS_CONCURRENCY", compress.to_string());
            env::set_var("MEDIAFLOW_CONVERT_CONCURRENCY", convert.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.queues.download_concurrency, download);
            prop_assert_eq!(config.queues.compress_concurrency, compress);
            prop_assert_eq!(config.queues.convert_concurrency, convert);
        }

        #[test]
        fn prop_env_overrides_logical_cores(
            initial_cores in proptest::option::of(1u32..128),
            override_cores in 1u32..256,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                "[queues]\n{}\n",
                initial_cores.map(|c| format!("logical_cores = {}", c)).unwrap_or_default()
            );
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("MEDIAFLOW_LOGICAL_CORES", override_cores.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.queues.logical_cores, Some(override_cores));
        }
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::parse_toml("[queues]\ncompress_concurrency = 4\n").unwrap();
        env::set_var("MEDIAFLOW_COMPRESS_CONCURRENCY", "many");
        env::set_var("MEDIAFLOW_FFMPEG", "   ");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.queues.compress_concurrency, 4);
        assert_eq!(config.tools.ffmpeg, None);
    }

    #[test]
    fn test_env_overrides_tool_paths() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("MEDIAFLOW_BIN_DIR", "/srv/tools");
        env::set_var("MEDIAFLOW_YT_DLP", "/usr/local/bin/yt-dlp");
        env::set_var("MEDIAFLOW_OUTPUT_DIR", "/data/downloads");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.tools.bin_dir, Some(PathBuf::from("/srv/tools")));
        assert_eq!(config.tools.yt_dlp, Some(PathBuf::from("/usr/local/bin/yt-dlp")));
        assert_eq!(config.tools.ffprobe, None);
        assert_eq!(config.download.output_dir, Some(PathBuf::from("/data/downloads")));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.queues, QueueConfig::default());
        assert_eq!(config.tools, ToolsConfig::default());
        assert_eq!(config.download.concurrent_fragments, 16);
        assert_eq!(config.compress.min_total_kbps, 200);
        assert_eq!(config.compress.max_audio_kbps, 320);
        assert_eq!(config.compress.default_audio_kbps, 160);
        assert!((config.compress.size_tolerance - 0.08).abs() < 1e-9);
        assert_eq!(config.convert.default_crf, 22);
        assert_eq!(config.convert.default_audio_kbps, 192);
        assert_eq!(config.convert.default_image_quality, 85);
    }

    #[test]
    fn test_load_or_default_handles_missing_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mediaflow.toml");
        fs::write(&path, "[queues\ndownload_concurrency = ").unwrap();

        match Config::load_or_default(&path) {
            Err(ConfigError::Parse(_)) => {}
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
