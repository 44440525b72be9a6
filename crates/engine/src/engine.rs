//! Unified front door over the three job queues.

use crate::concurrency::QueueLimits;
use crate::config::{Config, ConfigError};
use crate::job::{JobId, JobKind, JobRequest, JobState};
use crate::pipeline::{CompressPipeline, ConvertPipeline, DownloadPipeline, PipelineEnv};
use crate::progress::{ProgressEvent, ProgressHub, ProgressSink};
use crate::queue::TaskQueue;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for engine construction
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("task queues must be created inside a Tokio runtime")]
    NoRuntime,
}

/// Queue running [`DownloadPipeline`] jobs.
pub fn download_queue(env: PipelineEnv, limit: usize, hub: ProgressHub) -> Result<TaskQueue<DownloadPipeline>, EngineError> {
    TaskQueue::new(DownloadPipeline, env, limit, hub)
}

/// Queue running [`CompressPipeline`] jobs.
pub fn compress_queue(env: PipelineEnv, limit: usize, hub: ProgressHub) -> Result<TaskQueue<CompressPipeline>, EngineError> {
    TaskQueue::new(CompressPipeline, env, limit, hub)
}

/// Queue running [`ConvertPipeline`] jobs.
pub fn convert_queue(env: PipelineEnv, limit: usize, hub: ProgressHub) -> Result<TaskQueue<ConvertPipeline>, EngineError> {
    TaskQueue::new(ConvertPipeline, env, limit, hub)
}

/// Download, compress and convert queues sharing one progress hub.
pub struct MediaEngine {
    download: TaskQueue<DownloadPipeline>,
    compress: TaskQueue<CompressPipeline>,
    convert: TaskQueue<ConvertPipeline>,
    hub: ProgressHub,
    limits: QueueLimits,
}

impl MediaEngine {
    /// Engine with the default resolver and naming policy.
    pub fn new(config: Config) -> Result<Self, EngineError> {
        Self::with_env(PipelineEnv::new(config))
    }

    /// Loads `path` (missing file means defaults) and builds the engine.
    pub fn from_config_file<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let config = Config::load_or_default(path)?;
        Self::new(config)
    }

    pub fn with_env(env: PipelineEnv) -> Result<Self, EngineError> {
        let limits = QueueLimits::derive(&env.config.queues);
        let hub = ProgressHub::new();
        tracing::info!(
            cores = limits.total_cores,
            download = limits.download,
            compress = limits.compress,
            convert = limits.convert,
            "queue limits"
        );

        Ok(Self {
            download: download_queue(env.clone(), limits.download, hub.clone())?,
            compress: compress_queue(env.clone(), limits.compress, hub.clone())?,
            convert: convert_queue(env, limits.convert, hub.clone())?,
            hub,
            limits,
        })
    }

    /// Routes a request to the queue of its kind.
    pub fn submit(&self, request: JobRequest) -> JobId {
        match request {
            JobRequest::Download(req) => self.download.submit(req),
            JobRequest::Compress(req) => self.compress.submit(req),
            JobRequest::Convert(req) => self.convert.submit(req),
        }
    }

    pub fn cancel(&self, id: JobId) -> bool {
        match self.kind_of(id) {
            Some(JobKind::Download) => self.download.cancel(id),
            Some(JobKind::Compress) => self.compress.cancel(id),
            Some(JobKind::Convert) => self.convert.cancel(id),
            None => false,
        }
    }

    /// Cancels every unfinished job in every queue.
    pub fn cancel_all(&self) -> usize {
        self.download.cancel_all() + self.compress.cancel_all() + self.convert.cancel_all()
    }

    pub fn remove(&self, id: JobId) -> bool {
        self.download.remove(id) || self.compress.remove(id) || self.convert.remove(id)
    }

    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.download
            .state(id)
            .or_else(|| self.compress.state(id))
            .or_else(|| self.convert.state(id))
    }

    /// Which queue owns `id`
    pub fn kind_of(&self, id: JobId) -> Option<JobKind> {
        if self.download.state(id).is_some() {
            Some(JobKind::Download)
        } else if self.compress.state(id).is_some() {
            Some(JobKind::Compress)
        } else if self.convert.state(id).is_some() {
            Some(JobKind::Convert)
        } else {
            None
        }
    }

    /// True when no job is running or waiting in any queue.
    pub fn is_idle(&self) -> bool {
        self.download.running() + self.download.pending() == 0
            && self.compress.running() + self.compress.pending() == 0
            && self.convert.running() + self.convert.pending() == 0
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ProgressEvent> {
        self.hub.subscribe()
    }

    pub fn add_sink(&self, sink: Arc<dyn ProgressSink>) {
        self.hub.add_sink(sink);
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    pub fn download(&self) -> &TaskQueue<DownloadPipeline> {
        &self.download
    }

    pub fn compress(&self) -> &TaskQueue<CompressPipeline> {
        &self.compress
    }

    pub fn convert(&self) -> &TaskQueue<ConvertPipeline> {
        &self.convert
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::job::ConvertRequest;
    use crate::progress::Stage;
    use std::time::Duration;

    fn config_with_limits(download: u32, compress: u32, convert: u32) -> Config {
        Config {
            queues: QueueConfig {
                download_concurrency: download,
                compress_concurrency: compress,
                convert_concurrency: convert,
                logical_cores: Some(8),
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_queue_limits_follow_config() {
        let engine = MediaEngine::new(config_with_limits(2, 0, 1)).unwrap();
        assert_eq!(engine.download().limit(), 2);
        assert_eq!(engine.compress().limit(), 4);
        assert_eq!(engine.convert().limit(), 1);
        assert_eq!(engine.limits().total_cores, 8);
    }

    #[tokio::test]
    async fn test_submit_routes_by_kind_and_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MediaEngine::new(config_with_limits(1, 1, 1)).unwrap();
        let mut rx = engine.subscribe();

        let missing = dir.path().join("missing.mp4");
        let id = engine.submit(JobRequest::Convert(ConvertRequest::new(&missing, "mkv")));
        assert_eq!(engine.kind_of(id), Some(JobKind::Convert));
        assert!(engine.remove(id));

        let error = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if event.is_terminal() {
                break event;
            }
        };
        assert_eq!(error.job_id, id);
        assert_eq!(error.kind, JobKind::Convert);
        assert_eq!(error.stage, Stage::Error);
        assert!(error.message.unwrap().contains("input file not found"));
        assert_eq!(engine.state(id), Some(JobState::Errored));
        assert!(!engine.cancel(id));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let engine = MediaEngine::new(Config::default()).unwrap();
        let id = JobId::new();
        assert_eq!(engine.state(id), None);
        assert!(!engine.cancel(id));
        assert!(!engine.remove(id));
        assert_eq!(engine.cancel_all(), 0);
        assert!(engine.is_idle());
    }
}
