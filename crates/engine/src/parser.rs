//! Process output parsing.
//!
//! Turns raw subprocess output into normalized progress fragments:
//! - [`LineSplitter`] reassembles lines from arbitrary byte chunks
//! - [`parse_download_line`] understands the fetcher's output
//! - [`parse_ffmpeg_line`] understands the encoder's `-progress` channel and stderr
//!
//! Structured channels are always tried first. The regex fallbacks match the
//! human-readable output and are lossy and order-sensitive: the first rule that
//! matches wins and unmatched lines are dropped.

use crate::progress::TransferStats;
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;

/// Prefix of the structured progress lines requested from the fetcher.
pub const DOWNLOAD_PROGRESS_TAG: &str = "[MEDIAFLOW]";

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid ANSI regex"));

static DL_PERCENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[download\][^\n]*?(\d+(?:\.\d+)?)%").expect("valid percent regex")
});

static DL_TOTAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"of\s+~?\s*([\d.]+)\s*(KiB|MiB|GiB|TiB|KB|MB|GB|TB|B)\b")
        .expect("valid total regex")
});

static DL_SPEED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"at\s+([\d.]+\s*(?:KiB|MiB|GiB|TiB|KB|MB|GB|TB|B)/s)").expect("valid speed regex")
});

static DL_ETA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ETA\s+([\d:]+)").expect("valid ETA regex"));

static DL_MERGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(?:Merger|ffmpeg|VideoRemuxer)\]\s+(?:Merging|Muxing|Remuxing)")
        .expect("valid merge regex")
});

static DL_MERGE_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:Merging formats into|Remuxing video from \S+ to \S+; Destination:)\s+"?([^"]+)"?$"#)
        .expect("valid merge target regex")
});

static DL_DESTINATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(?:download|ExtractAudio)\]\s+Destination:\s+(.+)$")
        .expect("valid destination regex")
});

static DL_ALREADY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[download\]\s+(.+?) has already been downloaded").expect("valid regex")
});

static FF_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=\s*(-?\d+:\d{2}:\d{2}(?:\.\d+)?)").expect("valid time regex")
});

/// Incremental byte-to-line splitter.
///
/// Splits on `\n`, `\r\n` and bare `\r` (progress bars redraw with `\r`).
/// A `\r\n` pair split across two chunks yields a single line break, and
/// multi-byte UTF-8 sequences split across chunks are reassembled because
/// decoding only happens once a full line is buffered. ANSI escapes are
/// stripped and blank lines are skipped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
    pending_cr: bool,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' | b'\r' => {
                    if let Some(line) = self.take_line() {
                        lines.push(line);
                    }
                    self.pending_cr = byte == b'\r';
                }
                _ => self.buf.push(byte),
            }
        }
        lines
    }

    /// Flushes a trailing partial line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        self.pending_cr = false;
        self.take_line()
    }

    /// Bytes buffered for the current incomplete line
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    fn take_line(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let raw = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        let cleaned = strip_ansi(&raw);
        let trimmed = cleaned.trim_end();
        if trimmed.trim_start().is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// Removes ANSI escape sequences.
pub fn strip_ansi(line: &str) -> String {
    if line.contains('\x1b') {
        ANSI_ESCAPE.replace_all(line, "").into_owned()
    } else {
        line.to_string()
    }
}

/// Download progress fragment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadProgress {
    pub percent: Option<f64>,
    pub transfer: TransferStats,
}

/// Interpretation of one fetcher output line.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadLine {
    Progress(DownloadProgress),
    /// Separate streams are being merged or remuxed, optionally into the named file
    Merging(Option<PathBuf>),
    /// The fetcher reports the file it is writing
    Destination(PathBuf),
    AlreadyDownloaded,
    Error(String),
}

/// Parses one line of fetcher output.
pub fn parse_download_line(line: &str) -> Option<DownloadLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(rest) = line.strip_prefix(DOWNLOAD_PROGRESS_TAG) {
        return parse_progress_template(rest).map(DownloadLine::Progress);
    }

    if let Some(rest) = line.strip_prefix("ERROR:") {
        return Some(DownloadLine::Error(rest.trim().to_string()));
    }

    if DL_ALREADY.is_match(line) {
        return Some(DownloadLine::AlreadyDownloaded);
    }

    if DL_MERGE.is_match(line) {
        let target = DL_MERGE_TARGET
            .captures(line)
            .map(|c| PathBuf::from(c[1].trim()));
        return Some(DownloadLine::Merging(target));
    }

    if let Some(caps) = DL_DESTINATION.captures(line) {
        return Some(DownloadLine::Destination(PathBuf::from(caps[1].trim())));
    }

    parse_download_fallback(line).map(DownloadLine::Progress)
}

/// Parses the structured `pct|downloaded|total|speed|eta` payload.
fn parse_progress_template(payload: &str) -> Option<DownloadProgress> {
    let fields: Vec<&str> = payload.trim().split('|').map(str::trim).collect();
    if fields.len() < 5 {
        return None;
    }

    let percent = fields[0]
        .trim_end_matches('%')
        .trim()
        .parse::<f64>()
        .ok()
        .map(|p| p.clamp(0.0, 100.0));
    let downloaded_mb = parse_bytes_field(fields[1]).map(bytes_to_mb);
    let total_mb = parse_bytes_field(fields[2]).map(bytes_to_mb);

    let transfer = TransferStats {
        downloaded_mb,
        total_mb,
        speed: text_field(fields[3]),
        eta: text_field(fields[4]),
    };

    if percent.is_none() && transfer.is_empty() {
        return None;
    }
    Some(DownloadProgress { percent, transfer })
}

fn parse_bytes_field(field: &str) -> Option<f64> {
    field.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}

fn text_field(field: &str) -> Option<String> {
    match field {
        "" | "NA" | "N/A" | "None" | "Unknown" | "Unknown B/s" | "Unknown ETA" => None,
        other => Some(other.to_string()),
    }
}

/// Regex fallback for `[download]  45.3% of ~ 12.34MiB at 1.20MiB/s ETA 00:08`.
fn parse_download_fallback(line: &str) -> Option<DownloadProgress> {
    let percent = DL_PERCENT
        .captures(line)
        .and_then(|c| c[1].parse::<f64>().ok())?
        .clamp(0.0, 100.0);

    let total_mb = DL_TOTAL.captures(line).and_then(|c| {
        let value = c[1].parse::<f64>().ok()?;
        unit_to_mb(value, &c[2])
    });

    let transfer = TransferStats {
        downloaded_mb: total_mb.map(|t| t * percent / 100.0),
        total_mb,
        speed: DL_SPEED.captures(line).map(|c| c[1].to_string()),
        eta: DL_ETA.captures(line).map(|c| c[1].to_string()),
    };

    Some(DownloadProgress {
        percent: Some(percent),
        transfer,
    })
}

fn bytes_to_mb(bytes: f64) -> f64 {
    bytes / (1024.0 * 1024.0)
}

/// Converts a value with a size unit into megabytes (MiB).
pub fn unit_to_mb(value: f64, unit: &str) -> Option<f64> {
    let factor = match unit {
        "B" => 1.0 / (1024.0 * 1024.0),
        "KiB" => 1.0 / 1024.0,
        "MiB" => 1.0,
        "GiB" => 1024.0,
        "TiB" => 1024.0 * 1024.0,
        "KB" => 1000.0 / (1024.0 * 1024.0),
        "MB" => 1_000_000.0 / (1024.0 * 1024.0),
        "GB" => 1_000_000_000.0 / (1024.0 * 1024.0),
        "TB" => 1_000_000_000_000.0 / (1024.0 * 1024.0),
        _ => return None,
    };
    Some(value * factor)
}

/// Interpretation of one encoder output line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EncoderLine {
    /// Output position in seconds
    Time(f64),
    /// The `-progress` channel reported completion
    End,
}

/// Parses one encoder line: `-progress` key/value pairs first, then `time=` on stderr.
pub fn parse_ffmpeg_line(line: &str) -> Option<EncoderLine> {
    let line = line.trim();

    if let Some((key, value)) = line.split_once('=') {
        match key {
            // Older ffmpeg builds report microseconds under out_time_ms as well
            "out_time_us" | "out_time_ms" => {
                let micros = value.trim().parse::<i64>().ok()?;
                if micros < 0 {
                    return None;
                }
                return Some(EncoderLine::Time(micros as f64 / 1_000_000.0));
            }
            "out_time" => return parse_timestamp(value.trim()).map(EncoderLine::Time),
            "progress" => {
                return if value.trim() == "end" {
                    Some(EncoderLine::End)
                } else {
                    None
                };
            }
            _ => {}
        }
    }

    FF_TIME
        .captures(line)
        .and_then(|c| parse_timestamp(&c[1]))
        .map(EncoderLine::Time)
}

/// Parses `HH:MM:SS(.fraction)` into seconds; negative times yield None.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    if value.starts_with('-') {
        return None;
    }
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Time-based percent, clamped to `[0, 99]`.
///
/// 100 is reserved for the `done` event.
pub fn encode_percent(current_secs: f64, total_secs: f64) -> Option<f64> {
    if total_secs.is_nan() || total_secs <= 0.0 || !current_secs.is_finite() {
        return None;
    }
    Some((current_secs / total_secs * 100.0).clamp(0.0, 99.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn split_all(chunks: &[&[u8]]) -> Vec<String> {
        let mut splitter = LineSplitter::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(splitter.push(chunk));
        }
        out.extend(splitter.finish());
        out
    }

    #[test]
    fn test_splitter_line_endings() {
        let lines = split_all(&[b"one\ntwo\r\nthree\rfour"]);
        assert_eq!(lines, vec!["one", "two", "three", "four"]);
    }

    #[test]
    fn test_splitter_crlf_across_chunks() {
        let lines = split_all(&[b"first\r", b"\nsecond\n"]);
        assert_eq!(lines, vec!["first", "second"]);
    }

    #[test]
    fn test_splitter_utf8_across_chunks() {
        let text = "héllo wörld\n".as_bytes();
        // split inside the two-byte 'é'
        let lines = split_all(&[&text[..2], &text[2..]]);
        assert_eq!(lines, vec!["héllo wörld"]);
    }

    #[test]
    fn test_splitter_buffers_partial_line() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"partial").is_empty());
        assert_eq!(splitter.pending_len(), 7);
        assert_eq!(splitter.push(b" line\n"), vec!["partial line"]);
        assert_eq!(splitter.pending_len(), 0);
    }

    #[test]
    fn test_splitter_strips_ansi_and_skips_blank() {
        let lines = split_all(&[b"\x1b[0;32mgreen\x1b[0m\n\n   \r\nend\n"]);
        assert_eq!(lines, vec!["green", "end"]);
    }

    #[test]
    fn test_structured_download_line() {
        let line = "[MEDIAFLOW]  45.3%|1048576|4194304| 1.20MiB/s|00:08";
        match parse_download_line(line) {
            Some(DownloadLine::Progress(p)) => {
                assert_eq!(p.percent, Some(45.3));
                assert_eq!(p.transfer.downloaded_mb, Some(1.0));
                assert_eq!(p.transfer.total_mb, Some(4.0));
                assert_eq!(p.transfer.speed.as_deref(), Some("1.20MiB/s"));
                assert_eq!(p.transfer.eta.as_deref(), Some("00:08"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_structured_line_with_unknown_fields() {
        let line = "[MEDIAFLOW] 10.0%|2048|NA|Unknown B/s|Unknown";
        match parse_download_line(line) {
            Some(DownloadLine::Progress(p)) => {
                assert_eq!(p.percent, Some(10.0));
                assert_eq!(p.transfer.total_mb, None);
                assert_eq!(p.transfer.speed, None);
                assert_eq!(p.transfer.eta, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fallback_download_line() {
        let line = "[download]  50.0% of ~ 10.00MiB at  2.00MiB/s ETA 00:05";
        match parse_download_line(line) {
            Some(DownloadLine::Progress(p)) => {
                assert_eq!(p.percent, Some(50.0));
                assert_eq!(p.transfer.total_mb, Some(10.0));
                assert_eq!(p.transfer.downloaded_mb, Some(5.0));
                assert_eq!(p.transfer.speed.as_deref(), Some("2.00MiB/s"));
                assert_eq!(p.transfer.eta.as_deref(), Some("00:05"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_download_markers() {
        assert_eq!(
            parse_download_line(r#"[Merger] Merging formats into "/out/Clip [1080p] (abc).mp4""#),
            Some(DownloadLine::Merging(Some(PathBuf::from("/out/Clip [1080p] (abc).mp4"))))
        );
        assert_eq!(
            parse_download_line("[download] /out/a.mp4 has already been downloaded"),
            Some(DownloadLine::AlreadyDownloaded)
        );
        assert_eq!(
            parse_download_line("ERROR: [youtube] abc: Video unavailable"),
            Some(DownloadLine::Error("[youtube] abc: Video unavailable".to_string()))
        );
        assert_eq!(
            parse_download_line("[download] Destination: /out/a.f137.mp4"),
            Some(DownloadLine::Destination(PathBuf::from("/out/a.f137.mp4")))
        );
        assert_eq!(parse_download_line("[youtube] abc: Downloading webpage"), None);
    }

    #[test]
    fn test_ffmpeg_progress_channel() {
        assert_eq!(parse_ffmpeg_line("out_time_us=1500000"), Some(EncoderLine::Time(1.5)));
        assert_eq!(parse_ffmpeg_line("out_time_ms=2000000"), Some(EncoderLine::Time(2.0)));
        assert_eq!(
            parse_ffmpeg_line("out_time=00:01:02.500000"),
            Some(EncoderLine::Time(62.5))
        );
        assert_eq!(parse_ffmpeg_line("progress=end"), Some(EncoderLine::End));
        assert_eq!(parse_ffmpeg_line("progress=continue"), None);
        assert_eq!(parse_ffmpeg_line("out_time_us=N/A"), None);
        assert_eq!(parse_ffmpeg_line("out_time=-00:00:00.040000"), None);
        assert_eq!(parse_ffmpeg_line("bitrate=1200.3kbits/s"), None);
    }

    #[test]
    fn test_ffmpeg_stderr_fallback() {
        let line = "frame=  120 fps= 30 q=28.0 size=    512kB time=00:00:04.00 bitrate=1048.6kbits/s speed=1.0x";
        assert_eq!(parse_ffmpeg_line(line), Some(EncoderLine::Time(4.0)));
    }

    #[test]
    fn test_encode_percent_bounds() {
        assert_eq!(encode_percent(5.0, 10.0), Some(50.0));
        assert_eq!(encode_percent(20.0, 10.0), Some(99.0));
        assert_eq!(encode_percent(1.0, 0.0), None);
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(unit_to_mb(1024.0, "KiB"), Some(1.0));
        assert_eq!(unit_to_mb(2.0, "GiB"), Some(2048.0));
        assert_eq!(unit_to_mb(1.0, "parsecs"), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_chunking_does_not_change_lines(
            lines in proptest::collection::vec("[a-zé0-9ß]([a-zé0-9ß %]{0,18}[a-zé0-9ß])?", 1..12),
            seps in proptest::collection::vec(0usize..3, 12),
            cuts in proptest::collection::vec(1usize..7, 1..40),
        ) {
            let mut stream = Vec::new();
            for (i, line) in lines.iter().enumerate() {
                stream.extend_from_slice(line.as_bytes());
                let sep: &[u8] = match seps[i % seps.len()] {
                    0 => b"\n",
                    1 => b"\r\n",
                    _ => b"\r",
                };
                stream.extend_from_slice(sep);
            }

            let mut chunks = Vec::new();
            let mut rest = stream.as_slice();
            let mut i = 0;
            while !rest.is_empty() {
                let n = cuts[i % cuts.len()].min(rest.len());
                let (head, tail) = rest.split_at(n);
                chunks.push(head);
                rest = tail;
                i += 1;
            }

            prop_assert_eq!(split_all(&chunks), lines);
        }

        #[test]
        fn prop_encode_percent_in_range(current in 0.0f64..1e6, total in 0.001f64..1e6) {
            let pct = encode_percent(current, total).unwrap();
            prop_assert!((0.0..=99.0).contains(&pct));
        }
    }
}
