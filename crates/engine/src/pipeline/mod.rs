//! Job pipelines.
//!
//! A pipeline executes one job from start to its deliverable. It reports
//! progress through its [`JobContext`], runs every external process through
//! it so the process is tracked for cancellation, and returns the produced
//! file. The owning queue turns the result into the terminal event.

mod compress;
mod convert;
mod download;

pub use compress::CompressPipeline;
pub use convert::{plan_route, ConvertPipeline, Route};
pub use download::DownloadPipeline;

use crate::classify::MediaKind;
use crate::cleanup::Artifact;
use crate::config::Config;
use crate::control::JobControl;
use crate::encode::ffmpeg::thumbnail_command;
use crate::job::{JobId, JobKind};
use crate::naming::{file_url, DefaultOutputPolicy, OutputPathPolicy};
use crate::probe::{probe_media, ProbeError, ProbeResult};
use crate::progress::{ProgressEvent, ProgressMeta, Stage};
use crate::runner::{run_capture, run_tracked, OutputStream, ProcessTracker, RunError, RunOutput};
use crate::tools::{BinaryResolver, ConfiguredResolver, Tool, ToolError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;

/// Error type for pipeline execution
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The job was canceled
    #[error("canceled")]
    Canceled,

    #[error("input file not found: {0}")]
    MissingInput(PathBuf),

    #[error("cannot convert {from} input to .{to}")]
    UnsupportedConversion { from: MediaKind, to: String },

    #[error("could not determine the duration of {0}")]
    UnknownDuration(PathBuf),

    #[error(transparent)]
    Process(RunError),

    #[error(transparent)]
    Probe(ProbeError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The tools exited cleanly but the expected file is missing or empty
    #[error("expected output was not produced: {0}")]
    MissingOutput(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("pipeline panicked: {0}")]
    Panicked(String),
}

impl From<RunError> for PipelineError {
    fn from(e: RunError) -> Self {
        match e {
            RunError::Canceled => PipelineError::Canceled,
            other => PipelineError::Process(other),
        }
    }
}

impl From<ProbeError> for PipelineError {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::Run(RunError::Canceled) => PipelineError::Canceled,
            other => PipelineError::Probe(other),
        }
    }
}

/// What a successful pipeline produced.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub filepath: PathBuf,
    pub meta: Option<ProgressMeta>,
}

/// Collaborators shared by every job of an engine.
#[derive(Clone)]
pub struct PipelineEnv {
    pub resolver: Arc<dyn BinaryResolver>,
    pub config: Arc<Config>,
    pub naming: Arc<dyn OutputPathPolicy>,
}

impl PipelineEnv {
    /// Environment with the default resolver and naming policy for `config`.
    pub fn new(config: Config) -> Self {
        Self {
            resolver: Arc::new(ConfiguredResolver::new(config.tools.clone())),
            config: Arc::new(config),
            naming: Arc::new(DefaultOutputPolicy),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn BinaryResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_naming(mut self, naming: Arc<dyn OutputPathPolicy>) -> Self {
        self.naming = naming;
        self
    }
}

impl Default for PipelineEnv {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

/// Everything a running pipeline may touch.
pub struct JobContext {
    control: Arc<JobControl>,
    env: PipelineEnv,
}

impl JobContext {
    pub fn new(control: Arc<JobControl>, env: PipelineEnv) -> Self {
        Self { control, env }
    }

    pub fn id(&self) -> JobId {
        self.control.id()
    }

    pub fn kind(&self) -> JobKind {
        self.control.kind()
    }

    pub fn config(&self) -> &Config {
        &self.env.config
    }

    pub fn naming(&self) -> &dyn OutputPathPolicy {
        self.env.naming.as_ref()
    }

    pub fn control(&self) -> &JobControl {
        &self.control
    }

    /// Errors with [`PipelineError::Canceled`] once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.control.is_canceled() {
            Err(PipelineError::Canceled)
        } else {
            Ok(())
        }
    }

    pub fn event(&self, stage: Stage) -> ProgressEvent {
        self.control.event(stage)
    }

    pub fn emit(&self, event: ProgressEvent) {
        self.control.emit(event);
    }

    /// Shorthand for an event carrying only a stage and a percent.
    pub fn stage(&self, stage: Stage, percent: f64) {
        self.emit(self.event(stage).with_percent(percent));
    }

    pub fn register_artifact(&self, artifact: Artifact) {
        self.control.register_artifact(artifact);
    }

    pub fn tool(&self, tool: Tool) -> Result<PathBuf, PipelineError> {
        Ok(self.env.resolver.resolve(tool)?)
    }

    /// Runs a tracked process, checking for cancellation before and after.
    pub async fn run<F>(&self, command: Command, on_line: F) -> Result<RunOutput, PipelineError>
    where
        F: FnMut(OutputStream, &str) + Send,
    {
        self.checkpoint()?;
        let output = run_tracked(self.control.as_ref(), command.into(), on_line).await?;
        self.checkpoint()?;
        Ok(output)
    }

    /// Runs a tracked process and returns its stdout.
    pub async fn capture(&self, command: Command) -> Result<String, PipelineError> {
        self.checkpoint()?;
        let stdout = run_capture(self.control.as_ref(), command.into()).await?;
        self.checkpoint()?;
        Ok(stdout)
    }

    /// Probes a local file with the prober tool.
    pub async fn probe(&self, path: &Path) -> Result<ProbeResult, PipelineError> {
        let prober = self.tool(Tool::Prober)?;
        self.checkpoint()?;
        let result = probe_media(self.control.as_ref(), &prober, path).await?;
        self.checkpoint()?;
        Ok(result)
    }

    /// Grabs a preview frame of a video into the temp directory.
    ///
    /// Returns the frame's `file://` URL. Failures other than cancellation
    /// only cost the preview.
    pub async fn video_thumbnail(&self, encoder: &Path, input: &Path) -> Result<Option<String>, PipelineError> {
        let frame = std::env::temp_dir().join(format!("mediaflow-thumb-{}.jpg", self.id()));
        match self.run(thumbnail_command(encoder, input, &frame), |_, _| {}).await {
            Ok(_) => Ok(file_url(&frame)),
            Err(PipelineError::Canceled) => Err(PipelineError::Canceled),
            Err(e) => {
                tracing::debug!(job_id = %self.id(), error = %e, "thumbnail grab failed");
                Ok(None)
            }
        }
    }
}

/// A job type the queue can execute.
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    type Request: Send + Sync + 'static;

    const KIND: JobKind;

    async fn run(&self, ctx: &JobContext, request: &Self::Request) -> Result<Outcome, PipelineError>;
}

/// Picks and creates the directory a job writes into.
///
/// The first present candidate wins; the working directory is the last
/// resort. The result is absolute.
pub(crate) async fn prepare_output_dir(candidates: &[Option<&Path>]) -> Result<PathBuf, PipelineError> {
    let dir = match candidates.iter().flatten().find(|p| !p.as_os_str().is_empty()) {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir()?,
    };
    let dir = std::path::absolute(&dir)?;
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

/// Size of a regular input file, or [`PipelineError::MissingInput`].
pub(crate) async fn input_size(path: &Path) -> Result<u64, PipelineError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        _ => Err(PipelineError::MissingInput(path.to_path_buf())),
    }
}

/// Size of a produced file, or [`PipelineError::MissingOutput`] when absent or empty.
pub(crate) async fn output_size(path: &Path) -> Result<u64, PipelineError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(meta.len()),
        _ => Err(PipelineError::MissingOutput(path.to_path_buf())),
    }
}

pub(crate) fn bytes_to_mb(bytes: u64) -> f64 {
    let mb = bytes as f64 / (1024.0 * 1024.0);
    (mb * 100.0).round() / 100.0
}

/// File stem used as the title of local inputs.
pub(crate) fn input_title(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
