//! Encoder command builders.
//!
//! Every builder returns a `std::process::Command` that writes machine
//! readable progress to stdout (`-progress pipe:1`) and never prompts.
//! The output path is always the last argument.

use crate::job::ImageFormat;
use crate::quality::{mjpeg_qscale, native_quality};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Null muxer target for the analysis pass
#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

/// Codec strategy for an audio target extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Mp3,
    Aac,
    Vorbis,
    Opus,
    Flac,
    Pcm,
}

impl AudioCodec {
    /// Strategy for a target extension, or None when the extension is not audio.
    pub fn for_extension(ext: &str) -> Option<Self> {
        match ext {
            "mp3" => Some(AudioCodec::Mp3),
            "aac" | "m4a" => Some(AudioCodec::Aac),
            "ogg" => Some(AudioCodec::Vorbis),
            "opus" => Some(AudioCodec::Opus),
            "flac" => Some(AudioCodec::Flac),
            "wav" => Some(AudioCodec::Pcm),
            _ => None,
        }
    }

    fn push_args(self, cmd: &mut Command, kbps: u32) {
        match self {
            AudioCodec::Mp3 => {
                cmd.args(["-c:a", "libmp3lame", "-b:a"]).arg(format!("{}k", kbps));
            }
            AudioCodec::Aac => {
                cmd.args(["-c:a", "aac", "-b:a"]).arg(format!("{}k", kbps));
            }
            // VBR quality scale; the bitrate knob does not apply
            AudioCodec::Vorbis => {
                cmd.args(["-c:a", "libvorbis", "-q:a", "5"]);
            }
            AudioCodec::Opus => {
                cmd.args(["-c:a", "libopus", "-b:a"])
                    .arg(format!("{}k", kbps.clamp(64, 256)));
            }
            AudioCodec::Flac => {
                cmd.args(["-c:a", "flac"]);
            }
            AudioCodec::Pcm => {
                cmd.args(["-c:a", "pcm_s16le"]);
            }
        }
    }
}

/// Base command shared by every encode.
fn base(program: &Path, input: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(["-hide_banner", "-nostdin", "-y", "-progress", "pipe:1"]);
    cmd.arg("-i").arg(input);
    cmd
}

/// Single image encode at a normalized quality.
pub fn image_command(
    program: &Path,
    input: &Path,
    output: &Path,
    format: ImageFormat,
    quality: u32,
) -> Command {
    let mut cmd = base(program, input);
    let codec = match format {
        ImageFormat::Webp => "libwebp",
        ImageFormat::Jpeg => "mjpeg",
    };
    cmd.args(["-c:v", codec, "-q:v"])
        .arg(native_quality(format, quality).to_string());
    cmd.arg(output);
    cmd
}

/// Parameters shared by both passes of a two-pass video encode.
#[derive(Debug, Clone)]
pub struct TwoPassParams {
    pub input: PathBuf,
    pub output: PathBuf,
    pub video_kbps: u32,
    pub audio_kbps: u32,
    /// Per-job pass-log prefix so concurrent jobs never share statistics
    pub passlog: PathBuf,
}

/// First (analysis) pass: video only, output discarded.
pub fn video_pass1_command(program: &Path, params: &TwoPassParams) -> Command {
    let mut cmd = base(program, &params.input);
    cmd.args(["-c:v", "libx264", "-preset", "medium", "-b:v"])
        .arg(format!("{}k", params.video_kbps));
    cmd.args(["-pass", "1", "-passlogfile"]).arg(&params.passlog);
    cmd.args(["-an", "-f", "null", NULL_DEVICE]);
    cmd
}

/// Second pass: final video plus AAC audio.
pub fn video_pass2_command(program: &Path, params: &TwoPassParams) -> Command {
    let mut cmd = base(program, &params.input);
    cmd.args(["-c:v", "libx264", "-preset", "medium", "-b:v"])
        .arg(format!("{}k", params.video_kbps));
    cmd.args(["-pass", "2", "-passlogfile"]).arg(&params.passlog);
    cmd.args(["-c:a", "aac", "-b:a"])
        .arg(format!("{}k", params.audio_kbps));
    cmd.args(["-movflags", "+faststart"]);
    cmd.arg(&params.output);
    cmd
}

/// Audio-only AAC encode at a fixed bitrate.
pub fn audio_command(program: &Path, input: &Path, output: &Path, kbps: u32) -> Command {
    let mut cmd = base(program, input);
    cmd.arg("-vn");
    AudioCodec::Aac.push_args(&mut cmd, kbps);
    cmd.arg(output);
    cmd
}

/// Image-to-image conversion. Quality only applies to lossy targets.
pub fn convert_image_command(
    program: &Path,
    input: &Path,
    output: &Path,
    ext: &str,
    quality: u32,
) -> Command {
    let mut cmd = base(program, input);
    match ext {
        "webp" => {
            cmd.args(["-c:v", "libwebp", "-q:v"])
                .arg(quality.clamp(1, 100).to_string());
        }
        "jpg" | "jpeg" => {
            cmd.arg("-q:v").arg(mjpeg_qscale(quality).to_string());
        }
        _ => {}
    }
    cmd.arg(output);
    cmd
}

/// Audio conversion or audio extraction from a video input.
pub fn convert_audio_command(
    program: &Path,
    input: &Path,
    output: &Path,
    codec: AudioCodec,
    kbps: u32,
) -> Command {
    let mut cmd = base(program, input);
    cmd.arg("-vn");
    codec.push_args(&mut cmd, kbps);
    cmd.arg(output);
    cmd
}

/// Conversion into a video container.
pub fn convert_video_command(
    program: &Path,
    input: &Path,
    output: &Path,
    ext: &str,
    crf: u32,
    audio_kbps: u32,
) -> Command {
    let mut cmd = base(program, input);
    match ext {
        "webm" => {
            cmd.args(["-c:v", "libvpx-vp9", "-b:v", "0", "-crf"])
                .arg(crf.to_string());
            AudioCodec::Opus.push_args(&mut cmd, audio_kbps);
        }
        "gif" => {
            cmd.args(["-vf", "fps=12,scale=480:-1:flags=lanczos", "-loop", "0", "-an"]);
        }
        _ => {
            cmd.args(["-c:v", "libx264", "-preset", "medium", "-crf"])
                .arg(crf.to_string());
            cmd.args(["-pix_fmt", "yuv420p"]);
            AudioCodec::Aac.push_args(&mut cmd, audio_kbps);
            if ext == "mp4" || ext == "mov" {
                cmd.args(["-movflags", "+faststart"]);
            }
        }
    }
    cmd.arg(output);
    cmd
}

/// Re-encode a finished download to H.264 for players that need it.
pub fn recode_h264_command(program: &Path, input: &Path, output: &Path) -> Command {
    let mut cmd = base(program, input);
    cmd.args([
        "-c:v", "libx264", "-pix_fmt", "yuv420p", "-preset", "veryfast", "-c:a", "copy",
        "-movflags", "+faststart",
    ]);
    cmd.arg(output);
    cmd
}

/// 320px-wide frame grab one second in.
pub fn thumbnail_command(program: &Path, input: &Path, output: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(["-hide_banner", "-nostdin", "-y", "-loglevel", "error", "-ss", "1"]);
    cmd.arg("-i").arg(input);
    cmd.args(["-frames:v", "1", "-vf", "scale=320:-1"]);
    cmd.arg(output);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    fn value_after(args: &[String], flag: &str) -> Option<String> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1).cloned())
    }

    #[test]
    fn test_every_encode_reports_progress_and_ends_with_output() {
        let ff = Path::new("/bin/ffmpeg");
        let input = Path::new("/in/a.mov");
        let output = Path::new("/out/b.mp4");
        let commands = vec![
            image_command(ff, input, output, ImageFormat::Webp, 80),
            audio_command(ff, input, output, 128),
            convert_video_command(ff, input, output, "mp4", 22, 192),
            recode_h264_command(ff, input, output),
        ];
        for cmd in commands {
            let args = args(&cmd);
            assert_eq!(value_after(&args, "-progress").as_deref(), Some("pipe:1"));
            assert_eq!(value_after(&args, "-i").as_deref(), Some("/in/a.mov"));
            assert_eq!(args.last().map(String::as_str), Some("/out/b.mp4"));
        }
    }

    #[test]
    fn test_image_quality_mapping() {
        let ff = Path::new("ffmpeg");
        let jpeg = args(&image_command(ff, Path::new("a.png"), Path::new("a.jpg"), ImageFormat::Jpeg, 85));
        assert_eq!(value_after(&jpeg, "-c:v").as_deref(), Some("mjpeg"));
        assert_eq!(value_after(&jpeg, "-q:v").as_deref(), Some("8"));

        let webp = args(&image_command(ff, Path::new("a.png"), Path::new("a.webp"), ImageFormat::Webp, 80));
        assert_eq!(value_after(&webp, "-c:v").as_deref(), Some("libwebp"));
        assert_eq!(value_after(&webp, "-q:v").as_deref(), Some("80"));
    }

    #[test]
    fn test_two_pass_commands() {
        let params = TwoPassParams {
            input: PathBuf::from("/in/a.mkv"),
            output: PathBuf::from("/out/a (compressed-10MB).mp4"),
            video_kbps: 1238,
            audio_kbps: 160,
            passlog: PathBuf::from("/tmp/mediaflow-pass-123"),
        };
        let ff = Path::new("ffmpeg");

        let p1 = args(&video_pass1_command(ff, &params));
        assert_eq!(value_after(&p1, "-pass").as_deref(), Some("1"));
        assert_eq!(value_after(&p1, "-b:v").as_deref(), Some("1238k"));
        assert_eq!(value_after(&p1, "-passlogfile").as_deref(), Some("/tmp/mediaflow-pass-123"));
        assert!(p1.contains(&"-an".to_string()));
        assert_eq!(p1.last().map(String::as_str), Some(NULL_DEVICE));

        let p2 = args(&video_pass2_command(ff, &params));
        assert_eq!(value_after(&p2, "-pass").as_deref(), Some("2"));
        assert_eq!(value_after(&p2, "-b:a").as_deref(), Some("160k"));
        assert_eq!(p2.last().map(String::as_str), Some("/out/a (compressed-10MB).mp4"));
    }

    #[test]
    fn test_audio_codec_table() {
        let ff = Path::new("ffmpeg");
        let (i, o) = (Path::new("a.wav"), Path::new("a.x"));

        let opus = args(&convert_audio_command(ff, i, o, AudioCodec::Opus, 400));
        assert_eq!(value_after(&opus, "-b:a").as_deref(), Some("256k"));

        let ogg = args(&convert_audio_command(ff, i, o, AudioCodec::Vorbis, 192));
        assert_eq!(value_after(&ogg, "-q:a").as_deref(), Some("5"));
        assert!(value_after(&ogg, "-b:a").is_none());

        let wav = args(&convert_audio_command(ff, i, o, AudioCodec::Pcm, 192));
        assert_eq!(value_after(&wav, "-c:a").as_deref(), Some("pcm_s16le"));

        assert_eq!(AudioCodec::for_extension("m4a"), Some(AudioCodec::Aac));
        assert_eq!(AudioCodec::for_extension("mp4"), None);
    }

    #[test]
    fn test_video_container_strategies() {
        let ff = Path::new("ffmpeg");
        let (i, o) = (Path::new("a.mov"), Path::new("a.out"));

        let webm = args(&convert_video_command(ff, i, o, "webm", 30, 128));
        assert_eq!(value_after(&webm, "-c:v").as_deref(), Some("libvpx-vp9"));
        assert_eq!(value_after(&webm, "-crf").as_deref(), Some("30"));
        assert_eq!(value_after(&webm, "-c:a").as_deref(), Some("libopus"));

        let gif = args(&convert_video_command(ff, i, o, "gif", 22, 192));
        assert_eq!(
            value_after(&gif, "-vf").as_deref(),
            Some("fps=12,scale=480:-1:flags=lanczos")
        );

        let mkv = args(&convert_video_command(ff, i, o, "mkv", 22, 192));
        assert_eq!(value_after(&mkv, "-c:v").as_deref(), Some("libx264"));
        assert!(!mkv.contains(&"-movflags".to_string()));
    }

    #[test]
    fn test_thumbnail_command() {
        let cmd = thumbnail_command(Path::new("ffmpeg"), Path::new("a.mp4"), Path::new("t.jpg"));
        let args = args(&cmd);
        assert_eq!(value_after(&args, "-ss").as_deref(), Some("1"));
        assert_eq!(value_after(&args, "-vf").as_deref(), Some("scale=320:-1"));
        assert_eq!(args.last().map(String::as_str), Some("t.jpg"));
    }
}
