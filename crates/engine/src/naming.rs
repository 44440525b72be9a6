//! Output file naming.

use crate::job::JobKind;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Longest title kept in a generated file name, in characters.
const MAX_TITLE_CHARS: usize = 180;

static FORBIDDEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1F]"#).expect("valid forbidden-char regex"));

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

static EXOTIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^\p{L}\p{N}\s\-_.()\[\]]").expect("valid exotic-char regex")
});

static RESERVED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(con|prn|aux|nul|com[1-9]|lpt[1-9])$").expect("valid reserved-name regex")
});

/// Makes an arbitrary title safe to use as a file name on every platform.
///
/// Letters and digits of any script survive. Characters Windows forbids and
/// control characters become spaces, whitespace runs collapse, remaining
/// symbols degrade to `_`, and reserved device names get a `_` prefix.
pub fn sanitize_filename(name: &str) -> String {
    let normalized: String = name
        .chars()
        .filter(|c| *c != '\u{FFFD}')
        .map(|c| match c {
            '\u{00A0}' => ' ',
            '\u{2018}' | '\u{2019}' | '\u{2032}' => '\'',
            '\u{201C}' | '\u{201D}' | '\u{2033}' => '"',
            other => other,
        })
        .collect();

    let replaced = FORBIDDEN.replace_all(&normalized, " ");
    let collapsed = WHITESPACE.replace_all(&replaced, " ");
    let degraded = EXOTIC.replace_all(collapsed.trim(), "_");
    // Windows drops trailing dots and spaces silently
    let trimmed = degraded.trim_end_matches(['.', ' ']);

    if is_reserved_device_name(trimmed) {
        format!("_{}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// `con`, `prn`, `aux`, `nul`, `com1-9`, `lpt1-9`, case-insensitive.
pub fn is_reserved_device_name(name: &str) -> bool {
    RESERVED.is_match(name)
}

/// `file://` URL for a local path, or None for relative paths.
pub fn file_url(path: &Path) -> Option<String> {
    url::Url::from_file_path(path).ok().map(String::from)
}

/// Formats a megabyte count for a file name tag: `10`, `2.5`.
pub fn format_megabytes(mb: f64) -> String {
    if (mb - mb.round()).abs() < 1e-9 {
        format!("{}", mb.round() as u64)
    } else {
        format!("{:.1}", mb)
    }
}

/// Pieces an output name is assembled from.
#[derive(Debug, Clone)]
pub struct OutputName<'a> {
    pub kind: JobKind,
    pub dir: &'a Path,
    pub title: &'a str,
    pub resolution: Option<&'a str>,
    pub source_id: Option<&'a str>,
    /// Free-form suffix such as `compressed-10MB`
    pub tag: Option<&'a str>,
    /// Extension without the dot
    pub ext: &'a str,
}

/// Decides where a job writes its output.
pub trait OutputPathPolicy: Send + Sync {
    fn output_path(&self, name: &OutputName<'_>) -> PathBuf;
}

/// `"{title} [{resolution}] ({id}) ({tag}).{ext}"`, omitting absent parts.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultOutputPolicy;

impl OutputPathPolicy for DefaultOutputPolicy {
    fn output_path(&self, name: &OutputName<'_>) -> PathBuf {
        let mut title: String = sanitize_filename(name.title)
            .chars()
            .take(MAX_TITLE_CHARS)
            .collect();
        if title.trim().is_empty() {
            title = match name.kind {
                JobKind::Download => "download".to_string(),
                JobKind::Compress | JobKind::Convert => "output".to_string(),
            };
        }

        let mut file_name = title.trim_end().to_string();
        if let Some(res) = name.resolution.map(sanitize_filename).filter(|r| !r.is_empty()) {
            file_name.push_str(&format!(" [{}]", res));
        }
        if let Some(id) = name.source_id.map(sanitize_filename).filter(|i| !i.is_empty()) {
            file_name.push_str(&format!(" ({})", id));
        }
        if let Some(tag) = name.tag.map(sanitize_filename).filter(|t| !t.is_empty()) {
            file_name.push_str(&format!(" ({})", tag));
        }
        file_name.push('.');
        file_name.push_str(name.ext.trim_start_matches('.'));

        name.dir.join(file_name)
    }
}
