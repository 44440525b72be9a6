//! Normalized progress protocol and subscriber fan-out.
//!
//! Every pipeline reports through [`ProgressEvent`]s. The queue owning a job
//! forwards each event to a [`ProgressHub`], which delivers it to every
//! registered [`ProgressSink`].

use crate::classify::MediaKind;
use crate::job::{JobId, JobKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Pipeline stage label carried by every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preparing,
    Probing,
    Downloading,
    Merging,
    Recoding,
    Compressing,
    Pass1,
    Pass2,
    Encoding,
    Done,
    Error,
    Canceled,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Error | Stage::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preparing => "preparing",
            Stage::Probing => "probing",
            Stage::Downloading => "downloading",
            Stage::Merging => "merging",
            Stage::Recoding => "recoding",
            Stage::Compressing => "compressing",
            Stage::Pass1 => "pass1",
            Stage::Pass2 => "pass2",
            Stage::Encoding => "encoding",
            Stage::Done => "done",
            Stage::Error => "error",
            Stage::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive metadata attached to progress events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcodec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acodec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    /// Duration in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_mb: Option<f64>,
    /// `file://` or remote URL of a preview image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_kind: Option<MediaKind>,
    /// Milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl ProgressMeta {
    /// Stamps the metadata with the current wall-clock time.
    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(now_millis());
        self
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Download transfer statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
}

impl TransferStats {
    pub fn is_empty(&self) -> bool {
        self.downloaded_mb.is_none()
            && self.total_mb.is_none()
            && self.speed.is_none()
            && self.eta.is_none()
    }
}

/// One progress report for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub kind: JobKind,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ProgressMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer: Option<TransferStats>,
}

impl ProgressEvent {
    pub fn new(job_id: JobId, kind: JobKind, stage: Stage) -> Self {
        Self {
            job_id,
            kind,
            stage,
            percent: None,
            filepath: None,
            message: None,
            meta: None,
            transfer: None,
        }
    }

    pub fn with_percent(mut self, percent: f64) -> Self {
        self.percent = Some(percent);
        self
    }

    pub fn with_filepath(mut self, path: impl Into<PathBuf>) -> Self {
        self.filepath = Some(path.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_meta(mut self, meta: ProgressMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_transfer(mut self, transfer: TransferStats) -> Self {
        if !transfer.is_empty() {
            self.transfer = Some(transfer);
        }
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// Receives progress events.
///
/// Called synchronously on the emitting task; implementations must not block.
///
/// No job lock is held during the call, so a sink may cancel or query the
/// job it is being told about.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Forwards events into an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn on_event(&self, event: &ProgressEvent) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.tx.send(event.clone());
    }
}

/// Adapts a closure into a sink.
pub struct FnSink<F>(pub F);

impl<F> ProgressSink for FnSink<F>
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        (self.0)(event)
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn on_event(&self, event: &ProgressEvent) {
        match event.stage {
            Stage::Done => tracing::info!(
                job_id = %event.job_id,
                kind = %event.kind,
                filepath = ?event.filepath,
                "job done"
            ),
            Stage::Error => tracing::warn!(
                job_id = %event.job_id,
                kind = %event.kind,
                message = event.message.as_deref().unwrap_or(""),
                "job failed"
            ),
            Stage::Canceled => tracing::info!(
                job_id = %event.job_id,
                kind = %event.kind,
                "job canceled"
            ),
            stage => tracing::debug!(
                job_id = %event.job_id,
                kind = %event.kind,
                stage = %stage,
                percent = ?event.percent,
                "progress"
            ),
        }
    }
}

/// Fan-out of events to any number of sinks.
///
/// Cheap to clone; clones share the subscriber list.
#[derive(Clone, Default)]
pub struct ProgressHub {
    sinks: Arc<RwLock<Vec<Arc<dyn ProgressSink>>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&self, sink: Arc<dyn ProgressSink>) {
        match self.sinks.write() {
            Ok(mut sinks) => sinks.push(sink),
            Err(poisoned) => poisoned.into_inner().push(sink),
        }
    }

    /// Registers a channel subscriber and returns its receiving end.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_sink(Arc::new(ChannelSink::new(tx)));
        rx
    }

    pub fn sink_count(&self) -> usize {
        match self.sinks.read() {
            Ok(sinks) => sinks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Delivers `event` to every sink.
    ///
    /// Sinks are snapshotted first so a sink may register further sinks.
    pub fn publish(&self, event: &ProgressEvent) {
        let sinks: Vec<Arc<dyn ProgressSink>> = match self.sinks.read() {
            Ok(sinks) => sinks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for sink in sinks {
            sink.on_event(event);
        }
    }
}

impl std::fmt::Debug for ProgressHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHub")
            .field("sinks", &self.sink_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_event_serializes_snake_case_without_empty_fields() {
        let event = ProgressEvent::new(JobId::new(), JobKind::Compress, Stage::Pass1)
            .with_percent(42.0);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["stage"], "pass1");
        assert_eq!(json["kind"], "compress");
        assert_eq!(json["percent"], 42.0);
        assert!(json.get("filepath").is_none());
        assert!(json.get("meta").is_none());
    }

    #[test]
    fn test_empty_transfer_is_dropped() {
        let event = ProgressEvent::new(JobId::new(), JobKind::Download, Stage::Downloading)
            .with_transfer(TransferStats::default());
        assert!(event.transfer.is_none());
    }

    #[test]
    fn test_hub_delivers_to_every_sink() {
        let hub = ProgressHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            hub.add_sink(Arc::new(FnSink(move |_: &ProgressEvent| {
                count.fetch_add(1, Ordering::SeqCst);
            })));
        }
        let mut rx = hub.subscribe();

        let event = ProgressEvent::new(JobId::new(), JobKind::Convert, Stage::Encoding);
        hub.publish(&event);

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(rx.try_recv().unwrap(), event);
        assert_eq!(hub.sink_count(), 4);
    }

    #[test]
    fn test_closed_channel_does_not_break_publish() {
        let hub = ProgressHub::new();
        drop(hub.subscribe());
        hub.add_sink(Arc::new(LogSink));
        hub.publish(&ProgressEvent::new(JobId::new(), JobKind::Download, Stage::Done));
    }

    #[test]
    fn test_meta_stamp() {
        let meta = ProgressMeta::default().stamped();
        assert!(meta.timestamp.unwrap() > 0);
    }
}
