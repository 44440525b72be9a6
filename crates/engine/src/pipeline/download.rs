//! Remote media download.

use super::{bytes_to_mb, output_size, prepare_output_dir, JobContext, Outcome, Pipeline, PipelineError};
use crate::classify::MediaKind;
use crate::cleanup::Artifact;
use crate::encode::ffmpeg::recode_h264_command;
use crate::encode::ytdlp::{fetch_command, metadata_command, needs_recode, FetchParams};
use crate::job::{DownloadRequest, JobKind, MediaType};
use crate::naming::OutputName;
use crate::parser::{encode_percent, parse_download_line, parse_ffmpeg_line, DownloadLine, EncoderLine};
use crate::probe::{parse_remote_meta, RemoteMeta};
use crate::progress::{ProgressMeta, Stage};
use crate::runner::RunError;
use crate::tools::Tool;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Fetches a URL with the fetcher, optionally re-encoding the result to H.264.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadPipeline;

/// Accepts only absolute http(s) URLs.
fn validate_url(raw: &str) -> Result<url::Url, PipelineError> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| PipelineError::InvalidRequest(format!("invalid URL {:?}: {}", raw, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(PipelineError::InvalidRequest(format!(
            "unsupported URL scheme {:?}",
            other
        ))),
    }
}

fn container_for(media_type: MediaType) -> &'static str {
    match media_type {
        MediaType::Video => "mp4",
        MediaType::Audio => "m4a",
    }
}

fn meta_from_remote(remote: &RemoteMeta, media_type: MediaType) -> ProgressMeta {
    ProgressMeta {
        title: remote.title.clone(),
        ext: Some(container_for(media_type).to_string()),
        vcodec: remote.vcodec.clone(),
        acodec: remote.acodec.clone(),
        resolution: remote.resolution.clone(),
        fps: remote.fps,
        duration: remote.duration,
        thumbnail: remote.thumbnail.clone(),
        media_kind: Some(match media_type {
            MediaType::Video => MediaKind::Video,
            MediaType::Audio => MediaKind::Audio,
        }),
        ..ProgressMeta::default()
    }
    .stamped()
}

/// Output-side facts collected while the fetcher runs.
#[derive(Debug, Default)]
struct FetchReport {
    merged_into: Option<PathBuf>,
    destination: Option<PathBuf>,
    last_error: Option<String>,
}

impl DownloadPipeline {
    async fn fetch_metadata(&self, ctx: &JobContext, fetcher: &Path, url: &str) -> Result<RemoteMeta, PipelineError> {
        match ctx.capture(metadata_command(fetcher, url)).await {
            Ok(stdout) => match parse_remote_meta(&stdout) {
                Ok(meta) => Ok(meta),
                Err(e) => {
                    tracing::warn!(job_id = %ctx.id(), error = %e, "could not parse remote metadata");
                    Ok(RemoteMeta::default())
                }
            },
            Err(PipelineError::Canceled) => Err(PipelineError::Canceled),
            Err(e) => {
                // The fetch itself reports a better error if the URL is unusable
                tracing::warn!(job_id = %ctx.id(), error = %e, "metadata probe failed");
                Ok(RemoteMeta::default())
            }
        }
    }

    /// First existing, non-empty file among the planned and reported outputs.
    async fn locate_output(&self, planned: &Path, report: &FetchReport) -> Result<PathBuf, PipelineError> {
        let candidates = [Some(planned), report.merged_into.as_deref(), report.destination.as_deref()];
        for candidate in candidates.into_iter().flatten() {
            if output_size(candidate).await.is_ok() {
                return Ok(candidate.to_path_buf());
            }
        }
        Err(PipelineError::MissingOutput(planned.to_path_buf()))
    }

    /// Re-encodes `output` to H.264 in place.
    ///
    /// A failed recode keeps the original download.
    async fn recode(&self, ctx: &JobContext, encoder: &Path, output: &Path, duration: Option<f64>) -> Result<(), PipelineError> {
        let stem = output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let scratch = output.with_file_name(format!("{}.recode.mp4", stem));
        ctx.register_artifact(Artifact::Scratch(scratch.clone()));

        ctx.stage(Stage::Recoding, 0.0);
        let total = duration.unwrap_or(0.0);
        let result = ctx
            .run(recode_h264_command(encoder, output, &scratch), |_, line| {
                if let Some(EncoderLine::Time(secs)) = parse_ffmpeg_line(line) {
                    if let Some(pct) = encode_percent(secs, total) {
                        ctx.stage(Stage::Recoding, pct);
                    }
                }
            })
            .await;

        match result {
            Ok(_) => {
                output_size(&scratch).await?;
                tokio::fs::rename(&scratch, output).await?;
                Ok(())
            }
            Err(PipelineError::Canceled) => Err(PipelineError::Canceled),
            Err(e) => {
                tracing::warn!(job_id = %ctx.id(), error = %e, "recode failed, keeping original download");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Pipeline for DownloadPipeline {
    type Request = DownloadRequest;

    const KIND: JobKind = JobKind::Download;

    async fn run(&self, ctx: &JobContext, request: &DownloadRequest) -> Result<Outcome, PipelineError> {
        ctx.emit(ctx.event(Stage::Preparing));
        let url = validate_url(&request.url)?;
        let fetcher = ctx.tool(Tool::Fetcher)?;
        // Only needed for merging and recoding; the fetcher may find its own
        let encoder = ctx.tool(Tool::Encoder).ok();

        let config = &ctx.config().download;
        let dir = prepare_output_dir(&[request.output_dir.as_deref(), config.output_dir.as_deref()]).await?;

        let remote = self.fetch_metadata(ctx, &fetcher, url.as_str()).await?;
        let mut meta = meta_from_remote(&remote, request.media_type);
        ctx.emit(ctx.event(Stage::Preparing).with_meta(meta.clone()));

        let ext = container_for(request.media_type);
        let resolution = match request.media_type {
            MediaType::Video => remote.resolution.as_deref(),
            MediaType::Audio => None,
        };
        let planned = ctx.naming().output_path(&OutputName {
            kind: JobKind::Download,
            dir: &dir,
            title: remote.title.as_deref().unwrap_or(""),
            resolution,
            source_id: remote.id.as_deref(),
            tag: None,
            ext,
        });
        ctx.register_artifact(Artifact::FetchOutput(planned.clone()));
        tracing::info!(job_id = %ctx.id(), url = %url, output = %planned.display(), "download planned");

        let params = FetchParams {
            url: url.to_string(),
            output: planned.clone(),
            media_type: request.media_type,
            quality: request.quality,
            source_height: remote.height,
            ffmpeg_location: encoder.clone(),
            concurrent_fragments: config.concurrent_fragments,
        };

        ctx.stage(Stage::Downloading, 0.0);
        let mut report = FetchReport::default();
        let result = ctx
            .run(fetch_command(&fetcher, &params), |_, line| match parse_download_line(line) {
                Some(DownloadLine::Progress(progress)) => {
                    let mut event = ctx.event(Stage::Downloading).with_transfer(progress.transfer);
                    if let Some(pct) = progress.percent {
                        // Separate streams each run to 100; done owns the final 100
                        event = event.with_percent(pct.min(99.0));
                    }
                    ctx.emit(event);
                }
                Some(DownloadLine::Merging(target)) => {
                    if target.is_some() {
                        report.merged_into = target;
                    }
                    ctx.emit(ctx.event(Stage::Merging));
                }
                Some(DownloadLine::Destination(path)) => report.destination = Some(path),
                Some(DownloadLine::AlreadyDownloaded) => ctx.stage(Stage::Downloading, 100.0),
                Some(DownloadLine::Error(message)) => report.last_error = Some(message),
                None => {}
            })
            .await;

        match result {
            Ok(_) => {}
            Err(PipelineError::Process(RunError::Failed { program, code, detail })) => {
                return Err(PipelineError::Process(RunError::Failed {
                    program,
                    code,
                    detail: report.last_error.take().unwrap_or(detail),
                }));
            }
            Err(e) => return Err(e),
        }

        let output = self.locate_output(&planned, &report).await?;

        if let Some(encoder) = &encoder {
            let max_height = config.recode_max_height;
            if needs_recode(request.media_type, remote.height, remote.vcodec.as_deref(), max_height) {
                self.recode(ctx, encoder, &output, remote.duration).await?;
            }
        }

        ctx.checkpoint()?;
        let size = output_size(&output).await?;
        meta.size_mb = Some(bytes_to_mb(size));
        Ok(Outcome {
            filepath: output,
            meta: Some(meta),
        })
    }
}
