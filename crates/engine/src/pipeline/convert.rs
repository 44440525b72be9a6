//! Format conversion of local files.

use super::{bytes_to_mb, input_size, input_title, output_size, prepare_output_dir, JobContext, Outcome, Pipeline, PipelineError};
use crate::classify::{classify_path, is_video_container, MediaKind, IMAGE_EXTENSIONS};
use crate::cleanup::Artifact;
use crate::encode::ffmpeg::{convert_audio_command, convert_image_command, convert_video_command, AudioCodec};
use crate::job::{ConvertRequest, JobKind};
use crate::naming::{file_url, OutputName};
use crate::parser::{encode_percent, parse_ffmpeg_line, EncoderLine};
use crate::progress::{ProgressMeta, Stage};
use crate::tools::Tool;
use async_trait::async_trait;

/// How a conversion is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Image,
    Audio(AudioCodec),
    Video,
}

/// Chooses the conversion route, or None when the pair is unsupported.
pub fn plan_route(from: MediaKind, to: &str) -> Option<Route> {
    match from {
        MediaKind::Image if IMAGE_EXTENSIONS.contains(&to) => Some(Route::Image),
        MediaKind::Image => None,
        MediaKind::Audio | MediaKind::Video if is_video_container(to) => Some(Route::Video),
        MediaKind::Audio | MediaKind::Video => AudioCodec::for_extension(to).map(Route::Audio),
    }
}

/// Percent for one encoder line. Without a known duration there is none.
fn encoding_percent(line: &str, duration: Option<f64>) -> Option<f64> {
    let total = duration?;
    match parse_ffmpeg_line(line)? {
        EncoderLine::Time(secs) => encode_percent(secs, total),
        EncoderLine::End => None,
    }
}

/// Converts a local file into the requested extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvertPipeline;

#[async_trait]
impl Pipeline for ConvertPipeline {
    type Request = ConvertRequest;

    const KIND: JobKind = JobKind::Convert;

    async fn run(&self, ctx: &JobContext, request: &ConvertRequest) -> Result<Outcome, PipelineError> {
        ctx.emit(ctx.event(Stage::Preparing));
        let input = request.input.as_path();
        let input_bytes = input_size(input).await?;

        let from = classify_path(input);
        let to = request.target_extension();
        let route = plan_route(from, &to).ok_or_else(|| PipelineError::UnsupportedConversion {
            from,
            to: to.clone(),
        })?;
        let encoder = ctx.tool(Tool::Encoder)?;

        let title = input_title(input);
        let mut meta = ProgressMeta {
            title: Some(title.clone()),
            ext: Some(to.clone()),
            size_mb: Some(bytes_to_mb(input_bytes)),
            media_kind: Some(from),
            ..ProgressMeta::default()
        }
        .stamped();
        meta.thumbnail = match from {
            MediaKind::Image => std::path::absolute(input).ok().as_deref().and_then(file_url),
            MediaKind::Video => ctx.video_thumbnail(&encoder, input).await?,
            MediaKind::Audio => None,
        };
        ctx.emit(ctx.event(Stage::Preparing).with_meta(meta.clone()));

        let dir = prepare_output_dir(&[request.output_dir.as_deref(), input.parent()]).await?;
        let absolute_input = std::path::absolute(input)?;
        let mut name = OutputName {
            kind: JobKind::Convert,
            dir: &dir,
            title: &title,
            resolution: None,
            source_id: None,
            tag: None,
            ext: &to,
        };
        let mut output = ctx.naming().output_path(&name);
        if output == absolute_input {
            name.tag = Some("converted");
            output = ctx.naming().output_path(&name);
        }
        ctx.register_artifact(Artifact::Protected(absolute_input));
        ctx.register_artifact(Artifact::Output(output.clone()));
        tracing::info!(job_id = %ctx.id(), input = %input.display(), output = %output.display(), ?route, "convert planned");

        let duration = if route == Route::Image {
            None
        } else {
            ctx.stage(Stage::Probing, 0.0);
            match ctx.probe(input).await {
                Ok(probe) => probe.duration(),
                Err(PipelineError::Canceled) => return Err(PipelineError::Canceled),
                Err(e) => {
                    tracing::warn!(job_id = %ctx.id(), error = %e, "probe failed, encoding without percent");
                    None
                }
            }
        };
        if duration.is_some() {
            meta.duration = duration;
        }

        let config = &ctx.config().convert;
        let audio_kbps = request.audio_kbps.unwrap_or(config.default_audio_kbps);
        let command = match route {
            Route::Image => {
                let quality = request.image_quality.unwrap_or(config.default_image_quality);
                convert_image_command(&encoder, input, &output, &to, quality)
            }
            Route::Audio(codec) => convert_audio_command(&encoder, input, &output, codec, audio_kbps),
            Route::Video => {
                let crf = request.crf.unwrap_or(config.default_crf);
                convert_video_command(&encoder, input, &output, &to, crf, audio_kbps)
            }
        };

        match duration {
            Some(_) => ctx.stage(Stage::Encoding, 0.0),
            None => ctx.emit(ctx.event(Stage::Encoding)),
        }
        ctx.run(command, |_, line| {
            if let Some(pct) = encoding_percent(line, duration) {
                ctx.stage(Stage::Encoding, pct);
            }
        })
        .await?;

        ctx.checkpoint()?;
        let size = output_size(&output).await?;
        meta.size_mb = Some(bytes_to_mb(size));
        Ok(Outcome {
            filepath: output,
            meta: Some(meta),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_routes() {
        assert_eq!(plan_route(MediaKind::Image, "webp"), Some(Route::Image));
        assert_eq!(plan_route(MediaKind::Image, "gif"), Some(Route::Image));
        assert_eq!(plan_route(MediaKind::Video, "gif"), Some(Route::Video));
        assert_eq!(plan_route(MediaKind::Audio, "mp4"), Some(Route::Video));
        assert_eq!(plan_route(MediaKind::Audio, "flac"), Some(Route::Audio(AudioCodec::Flac)));
        assert_eq!(plan_route(MediaKind::Video, "mp3"), Some(Route::Audio(AudioCodec::Mp3)));
        assert_eq!(plan_route(MediaKind::Video, "m4a"), Some(Route::Audio(AudioCodec::Aac)));
    }

    #[test]
    fn test_percent_needs_a_known_duration() {
        assert_eq!(encoding_percent("out_time_us=5000000", Some(10.0)), Some(50.0));
        assert_eq!(encoding_percent("out_time_us=5000000", None), None);
        assert_eq!(encoding_percent("out_time_us=500000000", None), None);
        assert_eq!(encoding_percent("progress=end", Some(10.0)), None);
        assert_eq!(encoding_percent("frame=  12 fps=0.0", Some(10.0)), None);
    }

    #[test]
    fn test_unsupported_pairs() {
        assert_eq!(plan_route(MediaKind::Image, "mp3"), None);
        assert_eq!(plan_route(MediaKind::Image, "mp4"), None);
        assert_eq!(plan_route(MediaKind::Audio, "png"), None);
        assert_eq!(plan_route(MediaKind::Video, "docx"), None);
        assert_eq!(
            plan_route(classify_path(Path::new("/in/clip.MOV")), "mp4"),
            Some(Route::Video)
        );
    }
}
