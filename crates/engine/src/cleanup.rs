//! Best-effort removal of job artifacts.
//!
//! Failures are logged and never surface as job errors.

use regex::Regex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use walkdir::WalkDir;

/// Temporary suffixes appended to a full planned file name.
static TEMP_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\.(?:part|ytdl|temp|tmp|fragment|frag|part-frag\d+)$").expect("valid temp suffix regex")
});

/// Per-format intermediates and sidecars the fetcher writes next to the planned stem.
static FETCH_INTERMEDIATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\.(?:f\d+\.[a-z0-9]+(?:\.part)?|part|ytdl|temp|part-frag\d+|info\.json|meta)$")
        .expect("valid fetch intermediate regex")
});

/// A file a job created, may create, or must leave alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// Encoder deliverable; removed with its partials unless the job succeeded
    Output(PathBuf),
    /// Fetcher deliverable; like `Output`, plus the fetcher's per-format intermediates
    FetchOutput(PathBuf),
    /// Intermediate file; always removed once the job is terminal
    Scratch(PathBuf),
    /// The job's input; never removed, whatever its name looks like
    Protected(PathBuf),
}

/// Removes a file, treating "already gone" as success.
pub fn remove_quietly(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed artifact");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove artifact");
            false
        }
    }
}

/// True when `file_name` is `planned` itself or `planned` plus a temporary suffix.
pub fn is_partial_of(planned: &Path, file_name: &str) -> bool {
    let Some(planned_name) = planned.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    match file_name.strip_prefix(planned_name) {
        Some("") => true,
        Some(rest) => TEMP_SUFFIX.is_match(rest),
        None => false,
    }
}

/// [`is_partial_of`], or a fetcher intermediate sharing the planned stem.
pub fn is_fetch_partial_of(planned: &Path, file_name: &str) -> bool {
    if is_partial_of(planned, file_name) {
        return true;
    }
    let Some(stem) = planned.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    file_name
        .strip_prefix(stem)
        .is_some_and(|rest| FETCH_INTERMEDIATE.is_match(rest))
}

/// Removes every file in `planned`'s directory that `matches`, except `protected` ones.
///
/// Returns the number of files removed.
pub fn remove_partial_outputs<F>(planned: &Path, matches: F, protected: &[PathBuf]) -> usize
where
    F: Fn(&Path, &str) -> bool,
{
    let Some(dir) = planned.parent() else {
        return 0;
    };
    let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };

    let mut removed = 0;
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let hit = entry
            .file_name()
            .to_str()
            .is_some_and(|name| matches(planned, name));
        if !hit {
            continue;
        }
        if is_protected(entry.path(), protected) {
            tracing::debug!(path = %entry.path().display(), "keeping protected file");
            continue;
        }
        if remove_quietly(entry.path()) {
            removed += 1;
        }
    }
    removed
}

fn is_protected(path: &Path, protected: &[PathBuf]) -> bool {
    let absolute = std::path::absolute(path).ok();
    protected
        .iter()
        .any(|p| p == path || absolute.as_deref() == Some(p.as_path()))
}

/// Cleans up after a terminal job.
///
/// Scratch files always go. Outputs and their partials go unless the job
/// produced its deliverable. Protected paths are never touched.
pub fn cleanup_artifacts(artifacts: &[Artifact], succeeded: bool) {
    let protected: Vec<PathBuf> = artifacts
        .iter()
        .filter_map(|a| match a {
            Artifact::Protected(path) => Some(std::path::absolute(path).unwrap_or_else(|_| path.clone())),
            _ => None,
        })
        .collect();

    for artifact in artifacts {
        let removed = match artifact {
            Artifact::Scratch(path) if !is_protected(path, &protected) => {
                remove_quietly(path);
                continue;
            }
            Artifact::Output(path) if !succeeded => remove_partial_outputs(path, is_partial_of, &protected),
            Artifact::FetchOutput(path) if !succeeded => {
                remove_partial_outputs(path, is_fetch_partial_of, &protected)
            }
            _ => continue,
        };
        if removed > 0 {
            tracing::info!(removed, "removed partial output");
        }
    }
}
