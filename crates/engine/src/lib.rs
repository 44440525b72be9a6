//! mediaflow engine
//!
//! Bounded job queues for downloading, compressing and converting media with
//! external tools (yt-dlp, ffmpeg, ffprobe). Every job reports normalized
//! progress events and ends with exactly one terminal event.

pub mod bitrate;
pub mod classify;
pub mod cleanup;
pub mod concurrency;
pub mod control;
pub mod encode;
pub mod engine;
pub mod job;
pub mod naming;
pub mod parser;
pub mod pipeline;
pub mod probe;
pub mod progress;
pub mod quality;
pub mod queue;
pub mod runner;
pub mod tools;

pub use mediaflow_config as config;

pub use classify::MediaKind;
pub use concurrency::QueueLimits;
pub use config::{Config, ConfigError};
pub use engine::{compress_queue, convert_queue, download_queue, EngineError, MediaEngine};
pub use job::{
    CompressRequest, CompressTarget, ConvertRequest, DownloadRequest, ImageFormat, JobId, JobKind,
    JobRequest, JobState, MediaType, QualityTier,
};
pub use naming::{DefaultOutputPolicy, OutputName, OutputPathPolicy};
pub use pipeline::{JobContext, Outcome, Pipeline, PipelineEnv, PipelineError};
pub use probe::{probe_file, ProbeError, ProbeResult};
pub use progress::{FnSink, LogSink, ProgressEvent, ProgressHub, ProgressMeta, ProgressSink, Stage};
pub use queue::TaskQueue;
pub use tools::{run_preflight, BinaryResolver, ConfiguredResolver, Tool, ToolError, ToolStatus};
