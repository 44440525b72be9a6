//! External tool resolution and preflight checks
//!
//! Maps the logical tools the pipelines need (fetcher, encoder, prober) to
//! executables on disk, and verifies that each one actually runs.

use crate::config::ToolsConfig;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Logical external tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    /// Remote media fetcher (yt-dlp)
    Fetcher,
    /// Encoder/transcoder (ffmpeg)
    Encoder,
    /// Metadata prober (ffprobe)
    Prober,
}

impl Tool {
    pub const ALL: [Tool; 3] = [Tool::Fetcher, Tool::Encoder, Tool::Prober];

    /// Executable base name, without platform suffix
    pub fn binary_name(self) -> &'static str {
        match self {
            Tool::Fetcher => "yt-dlp",
            Tool::Encoder => "ffmpeg",
            Tool::Prober => "ffprobe",
        }
    }

    /// Flag that makes the tool print its version and exit
    pub fn version_flag(self) -> &'static str {
        match self {
            Tool::Fetcher => "--version",
            Tool::Encoder | Tool::Prober => "-version",
        }
    }
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary_name())
    }
}

/// Error types for tool resolution and preflight checks
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool} not found: {detail}")]
    NotFound { tool: Tool, detail: String },

    #[error("{tool} failed to report its version: {detail}")]
    Unusable { tool: Tool, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves a logical tool to an executable path.
pub trait BinaryResolver: Send + Sync {
    fn resolve(&self, tool: Tool) -> Result<PathBuf, ToolError>;
}

/// Default resolver: explicit path, then `bin_dir`, then a `PATH` lookup.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredResolver {
    tools: ToolsConfig,
}

impl ConfiguredResolver {
    pub fn new(tools: ToolsConfig) -> Self {
        Self { tools }
    }

    fn explicit(&self, tool: Tool) -> Option<&PathBuf> {
        match tool {
            Tool::Fetcher => self.tools.yt_dlp.as_ref(),
            Tool::Encoder => self.tools.ffmpeg.as_ref(),
            Tool::Prober => self.tools.ffprobe.as_ref(),
        }
    }
}

impl BinaryResolver for ConfiguredResolver {
    fn resolve(&self, tool: Tool) -> Result<PathBuf, ToolError> {
        if let Some(path) = self.explicit(tool) {
            if path.is_file() {
                return Ok(path.clone());
            }
            return Err(ToolError::NotFound {
                tool,
                detail: format!("configured path {} does not exist", path.display()),
            });
        }

        if let Some(dir) = &self.tools.bin_dir {
            let candidate = dir.join(executable_file_name(tool));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        which::which(tool.binary_name()).map_err(|e| ToolError::NotFound {
            tool,
            detail: format!("{} (is it installed and on PATH?)", e),
        })
    }
}

/// File name of the tool's executable on this platform
fn executable_file_name(tool: Tool) -> String {
    if cfg!(windows) {
        format!("{}.exe", tool.binary_name())
    } else {
        tool.binary_name().to_string()
    }
}

/// Outcome of a single tool preflight check
#[derive(Debug, Clone, PartialEq)]
pub struct ToolStatus {
    pub tool: Tool,
    pub path: Option<PathBuf>,
    /// First line of the version output when the tool ran
    pub version: Option<String>,
    pub error: Option<String>,
}

impl ToolStatus {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs `<tool> <version flag>` and returns the first line of its output.
pub fn check_tool(resolver: &dyn BinaryResolver, tool: Tool) -> Result<(PathBuf, String), ToolError> {
    let path = resolver.resolve(tool)?;
    let version = read_version(&path, tool)?;
    Ok((path, version))
}

fn read_version(path: &Path, tool: Tool) -> Result<String, ToolError> {
    let output = Command::new(path)
        .arg(tool.version_flag())
        .output()
        .map_err(|e| ToolError::Unusable {
            tool,
            detail: format!("failed to run {}: {}", path.display(), e),
        })?;

    if !output.status.success() {
        return Err(ToolError::Unusable {
            tool,
            detail: format!("exited with {}", output.status),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or("(empty)").trim().to_string())
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 7.1 ..."
/// - N-prefixed: "ffmpeg version n7.1-... ..."
/// - ffprobe: "ffprobe version 7.1 ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output.lines().find(|line| {
        let lower = line.to_lowercase();
        lower.contains("ffmpeg version") || lower.contains("ffprobe version")
    })?;

    let version_part = version_line
        .to_lowercase()
        .split(" version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Run a preflight check for every tool and report each outcome
///
/// Failures do not short-circuit: all three tools are always checked.
pub fn run_preflight(resolver: &dyn BinaryResolver) -> Vec<ToolStatus> {
    Tool::ALL
        .iter()
        .map(|&tool| match check_tool(resolver, tool) {
            Ok((path, version)) => ToolStatus {
                tool,
                path: Some(path),
                version: Some(version),
                error: None,
            },
            Err(e) => ToolStatus {
                tool,
                path: resolver.resolve(tool).ok(),
                version: None,
                error: Some(e.to_string()),
            },
        })
        .collect()
}
