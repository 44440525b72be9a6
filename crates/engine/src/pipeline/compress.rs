//! Size-targeted compression of local images, audio and video.

use super::{bytes_to_mb, input_size, input_title, output_size, prepare_output_dir, JobContext, Outcome, Pipeline, PipelineError};
use crate::bitrate::{megabytes_to_bytes, plan_audio, plan_video, target_megabytes, target_total_kbps, BitrateLimits};
use crate::classify::{classify_path, MediaKind};
use crate::cleanup::Artifact;
use crate::encode::ffmpeg::{audio_command, image_command, video_pass1_command, video_pass2_command, TwoPassParams};
use crate::job::{CompressRequest, CompressTarget, JobKind};
use crate::naming::{file_url, format_megabytes, OutputName};
use crate::parser::{encode_percent, parse_ffmpeg_line, EncoderLine};
use crate::probe::ProbeResult;
use crate::progress::{ProgressMeta, Stage};
use crate::quality::{synthetic_percent, QualitySearch, SearchStep};
use crate::tools::Tool;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Compresses a file toward a target size.
///
/// Images go through a quality search. Audio is re-encoded to AAC at the
/// bitrate that fits the budget. Video gets a two-pass H.264 encode.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressPipeline;

fn validate_target(target: CompressTarget) -> Result<(), PipelineError> {
    let (value, label) = match target {
        CompressTarget::SizeMb(mb) => (mb, "target size"),
        CompressTarget::Percent(pct) => (pct, "target percent"),
    };
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(PipelineError::InvalidRequest(format!("{} must be positive, got {}", label, value)))
    }
}

fn output_extension(kind: MediaKind, request: &CompressRequest) -> &'static str {
    match kind {
        MediaKind::Image => request.image_format.extension(),
        MediaKind::Audio => "m4a",
        MediaKind::Video => "mp4",
    }
}

fn probe_meta(probe: &ProbeResult, title: &str, ext: &str, kind: MediaKind, input_bytes: u64) -> ProgressMeta {
    ProgressMeta {
        title: Some(title.to_string()),
        ext: Some(ext.to_string()),
        vcodec: probe.video_streams.first().map(|v| v.codec_name.clone()),
        acodec: probe.audio_streams.first().map(|a| a.codec_name.clone()),
        resolution: probe.resolution(),
        duration: probe.duration(),
        size_mb: Some(bytes_to_mb(input_bytes)),
        media_kind: Some(kind),
        ..ProgressMeta::default()
    }
    .stamped()
}

/// Pass-log files x264 writes for a given prefix.
fn passlog_files(prefix: &Path) -> Vec<PathBuf> {
    let base = prefix.to_string_lossy();
    ["-0.log", "-0.log.mbtree", "-0.log.temp", "-0.log.mbtree.temp"]
        .iter()
        .map(|suffix| PathBuf::from(format!("{}{}", base, suffix)))
        .collect()
}

impl CompressPipeline {
    async fn compress_image(
        &self,
        ctx: &JobContext,
        encoder: &Path,
        request: &CompressRequest,
        output: &Path,
        target_bytes: u64,
    ) -> Result<(), PipelineError> {
        let config = &ctx.config().compress;
        let mut search = QualitySearch::new(
            request.image_format,
            target_bytes,
            config.size_tolerance,
            config.max_image_attempts,
        );

        loop {
            ctx.stage(Stage::Compressing, synthetic_percent(search.attempts()));
            let command = image_command(encoder, &request.input, output, request.image_format, search.quality());
            ctx.run(command, |_, _| {}).await?;

            let actual = output_size(output).await?;
            match search.observe(actual) {
                SearchStep::Retry(quality) => {
                    tracing::debug!(job_id = %ctx.id(), actual, target_bytes, quality, "image off target, retrying");
                }
                SearchStep::Accept | SearchStep::Exhausted => {
                    tracing::debug!(job_id = %ctx.id(), attempts = search.attempts(), actual, "image search finished");
                    return Ok(());
                }
            }
        }
    }

    /// Runs one encoder invocation, reporting time-based percent under `stage`.
    async fn encode_timed(&self, ctx: &JobContext, stage: Stage, command: Command, duration: f64) -> Result<(), PipelineError> {
        ctx.stage(stage, 0.0);
        ctx.run(command, |_, line| {
            if let Some(EncoderLine::Time(secs)) = parse_ffmpeg_line(line) {
                if let Some(pct) = encode_percent(secs, duration) {
                    ctx.stage(stage, pct);
                }
            }
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Pipeline for CompressPipeline {
    type Request = CompressRequest;

    const KIND: JobKind = JobKind::Compress;

    async fn run(&self, ctx: &JobContext, request: &CompressRequest) -> Result<Outcome, PipelineError> {
        ctx.emit(ctx.event(Stage::Preparing));
        validate_target(request.target)?;
        let input = request.input.as_path();
        let input_bytes = input_size(input).await?;
        let encoder = ctx.tool(Tool::Encoder)?;

        let kind = classify_path(input);
        let ext = output_extension(kind, request);
        let title = input_title(input);
        let target_mb = target_megabytes(input_bytes, request.target);
        let target_bytes = megabytes_to_bytes(target_mb);

        let dir = prepare_output_dir(&[request.output_dir.as_deref(), input.parent()]).await?;
        let tag = format!("compressed-{}MB", format_megabytes(target_mb));
        let output = ctx.naming().output_path(&OutputName {
            kind: JobKind::Compress,
            dir: &dir,
            title: &title,
            resolution: None,
            source_id: None,
            tag: Some(&tag),
            ext,
        });
        let absolute_input = std::path::absolute(input)?;
        if absolute_input == output {
            return Err(PipelineError::InvalidRequest(format!(
                "output would overwrite the input {}",
                input.display()
            )));
        }
        ctx.register_artifact(Artifact::Protected(absolute_input));
        ctx.register_artifact(Artifact::Output(output.clone()));
        tracing::info!(job_id = %ctx.id(), input = %input.display(), output = %output.display(), target_mb, "compress planned");

        let mut meta = match kind {
            MediaKind::Image => {
                let meta = ProgressMeta {
                    title: Some(title.clone()),
                    ext: Some(ext.to_string()),
                    size_mb: Some(bytes_to_mb(input_bytes)),
                    thumbnail: std::path::absolute(input).ok().as_deref().and_then(file_url),
                    media_kind: Some(MediaKind::Image),
                    ..ProgressMeta::default()
                }
                .stamped();
                ctx.emit(ctx.event(Stage::Probing).with_meta(meta.clone()));
                self.compress_image(ctx, &encoder, request, &output, target_bytes).await?;
                meta
            }
            MediaKind::Audio | MediaKind::Video => {
                ctx.stage(Stage::Probing, 0.0);
                let probe = ctx.probe(input).await?;
                let duration = probe
                    .duration()
                    .ok_or_else(|| PipelineError::UnknownDuration(input.to_path_buf()))?;
                let mut meta = probe_meta(&probe, &title, ext, kind, input_bytes);
                if kind == MediaKind::Video {
                    meta.thumbnail = ctx.video_thumbnail(&encoder, input).await?;
                }
                ctx.emit(ctx.event(Stage::Probing).with_meta(meta.clone()));

                let limits = BitrateLimits::from(&ctx.config().compress);
                let total_kbps = target_total_kbps(target_bytes, duration, &limits)
                    .ok_or_else(|| PipelineError::UnknownDuration(input.to_path_buf()))?;

                if kind == MediaKind::Audio {
                    let kbps = plan_audio(total_kbps, &limits);
                    tracing::debug!(job_id = %ctx.id(), total_kbps, kbps, "audio bitrate planned");
                    self.encode_timed(ctx, Stage::Encoding, audio_command(&encoder, input, &output, kbps), duration)
                        .await?;
                } else {
                    let plan = plan_video(total_kbps, request.audio_kbps, &limits);
                    tracing::debug!(job_id = %ctx.id(), ?plan, "video bitrate planned");

                    let passlog = std::env::temp_dir().join(format!("mediaflow-2pass-{}", ctx.id()));
                    for file in passlog_files(&passlog) {
                        ctx.register_artifact(Artifact::Scratch(file));
                    }
                    let params = TwoPassParams {
                        input: input.to_path_buf(),
                        output: output.clone(),
                        video_kbps: plan.video_kbps,
                        audio_kbps: plan.audio_kbps,
                        passlog,
                    };
                    self.encode_timed(ctx, Stage::Pass1, video_pass1_command(&encoder, &params), duration)
                        .await?;
                    self.encode_timed(ctx, Stage::Pass2, video_pass2_command(&encoder, &params), duration)
                        .await?;
                }
                meta
            }
        };

        ctx.checkpoint()?;
        let size = output_size(&output).await?;
        meta.ext = Some(ext.to_string());
        meta.size_mb = Some(bytes_to_mb(size));
        Ok(Outcome {
            filepath: output,
            meta: Some(meta),
        })
    }
}
