//! Per-job control block.
//!
//! A [`JobControl`] is shared between the queue that owns a job, the pipeline
//! executing it, and whoever cancels it. It claims the terminal state exactly
//! once and keeps the set of live child processes so a cancellation can tear
//! them down.
//!
//! Events are queued in an outbox while the state lock is held and delivered
//! to sinks after it is released, one drainer at a time. Order is kept and a
//! sink may call back into the job (for example to cancel it).

use crate::cleanup::Artifact;
use crate::job::{JobId, JobKind, JobState};
use crate::progress::{ProgressEvent, ProgressHub, Stage};
use crate::runner::{ProcessTracker, TrackedProcess};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

/// Locks a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct ControlState {
    state: JobState,
    stage: Option<Stage>,
    percent: Option<f64>,
}

/// Shared state of one job.
#[derive(Debug)]
pub struct JobControl {
    id: JobId,
    kind: JobKind,
    hub: ProgressHub,
    canceled: AtomicBool,
    state: Mutex<ControlState>,
    outbox: Mutex<VecDeque<ProgressEvent>>,
    /// Held by whichever caller is delivering the outbox
    delivering: Mutex<()>,
    processes: Mutex<Vec<TrackedProcess>>,
    artifacts: Mutex<Vec<Artifact>>,
}

impl JobControl {
    pub fn new(id: JobId, kind: JobKind, hub: ProgressHub) -> Self {
        Self {
            id,
            kind,
            hub,
            canceled: AtomicBool::new(false),
            state: Mutex::new(ControlState {
                state: JobState::Queued,
                stage: None,
                percent: None,
            }),
            outbox: Mutex::new(VecDeque::new()),
            delivering: Mutex::new(()),
            processes: Mutex::new(Vec::new()),
            artifacts: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn state(&self) -> JobState {
        lock(&self.state).state
    }

    /// Blank event for this job.
    pub fn event(&self, stage: Stage) -> ProgressEvent {
        ProgressEvent::new(self.id, self.kind, stage)
    }

    /// `Queued -> Running`. False when the job was canceled while waiting.
    pub fn begin_running(&self) -> bool {
        let mut guard = lock(&self.state);
        if guard.state != JobState::Queued {
            return false;
        }
        guard.state = JobState::Running;
        true
    }

    /// Publishes a non-terminal event.
    ///
    /// Dropped once the job is terminal. Percent never decreases within a
    /// stage and starts over when the stage changes.
    pub fn emit(&self, mut event: ProgressEvent) -> bool {
        if event.is_terminal() {
            return self.finish(event);
        }

        {
            let mut guard = lock(&self.state);
            if guard.state.is_terminal() {
                return false;
            }

            if guard.stage != Some(event.stage) {
                guard.stage = Some(event.stage);
                guard.percent = None;
            }
            if let Some(pct) = event.percent {
                let pct = match guard.percent {
                    Some(last) if pct < last => last,
                    _ => pct.clamp(0.0, 100.0),
                };
                event.percent = Some(pct);
                guard.percent = Some(pct);
            }

            // Queued under the state lock so events of one job keep their order
            lock(&self.outbox).push_back(event);
        }
        self.deliver();
        true
    }

    /// Claims the terminal state and publishes the terminal event.
    ///
    /// Only the first claim wins. A `done` arriving after the job was
    /// canceled is turned into `canceled`.
    pub fn finish(&self, mut event: ProgressEvent) -> bool {
        let state = {
            let mut guard = lock(&self.state);
            if guard.state.is_terminal() {
                return false;
            }

            if event.stage == Stage::Done && self.is_canceled() {
                event = self.event(Stage::Canceled);
            }
            guard.state = match event.stage {
                Stage::Done => JobState::Done,
                Stage::Canceled => JobState::Canceled,
                _ => {
                    event.stage = Stage::Error;
                    JobState::Errored
                }
            };
            guard.stage = Some(event.stage);
            lock(&self.outbox).push_back(event);
            guard.state
        };

        tracing::info!(job_id = %self.id, kind = %self.kind, state = state.as_str(), "job finished");
        self.deliver();
        true
    }

    /// Hands queued events to the hub in order.
    ///
    /// A caller that finds another delivery in progress leaves its events to
    /// that one, which includes a sink re-entering on the same thread.
    fn deliver(&self) {
        loop {
            {
                let _delivering = match self.delivering.try_lock() {
                    Ok(guard) => guard,
                    Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                    Err(TryLockError::WouldBlock) => return,
                };
                loop {
                    let Some(event) = lock(&self.outbox).pop_front() else {
                        break;
                    };
                    self.hub.publish(&event);
                }
            }
            // Events queued between the last pop and the release would be stranded
            if lock(&self.outbox).is_empty() {
                return;
            }
        }
    }

    /// Requests cancellation.
    ///
    /// Publishes `canceled` unless the job is already terminal, then
    /// terminates every tracked process tree. Returns whether any live
    /// process was found.
    pub fn cancel(&self) -> bool {
        self.canceled.store(true, Ordering::SeqCst);
        self.finish(self.event(Stage::Canceled));

        let live: Vec<TrackedProcess> = lock(&self.processes).drain(..).collect();
        for process in &live {
            process.terminate();
        }
        !live.is_empty()
    }

    pub fn register_artifact(&self, artifact: Artifact) {
        lock(&self.artifacts).push(artifact);
    }

    pub fn take_artifacts(&self) -> Vec<Artifact> {
        std::mem::take(&mut *lock(&self.artifacts))
    }

    /// Number of processes currently registered
    pub fn live_processes(&self) -> usize {
        lock(&self.processes).len()
    }
}

impl ProcessTracker for JobControl {
    fn track(&self, process: TrackedProcess) -> bool {
        let mut processes = lock(&self.processes);
        // Checked under the lock: cancel() sets the flag before draining
        if self.is_canceled() {
            return false;
        }
        processes.push(process);
        true
    }

    fn untrack(&self, pid: u32) {
        lock(&self.processes).retain(|p| p.pid != pid);
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::FnSink;
    use std::sync::{Arc, OnceLock};

    fn control() -> (JobControl, tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) {
        let hub = ProgressHub::new();
        let rx = hub.subscribe();
        (JobControl::new(JobId::new(), JobKind::Compress, hub), rx)
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_percent_is_monotonic_within_a_stage() {
        let (control, mut rx) = control();
        control.begin_running();
        control.emit(control.event(Stage::Pass1).with_percent(40.0));
        control.emit(control.event(Stage::Pass1).with_percent(30.0));
        control.emit(control.event(Stage::Pass2).with_percent(5.0));

        let percents: Vec<_> = drain(&mut rx).iter().map(|e| e.percent).collect();
        assert_eq!(percents, vec![Some(40.0), Some(40.0), Some(5.0)]);
    }

    #[test]
    fn test_terminal_claim_happens_once() {
        let (control, mut rx) = control();
        control.begin_running();
        assert!(control.finish(control.event(Stage::Done)));
        assert!(!control.finish(control.event(Stage::Error)));
        assert!(!control.cancel());
        assert!(!control.emit(control.event(Stage::Encoding)));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stage, Stage::Done);
        assert_eq!(control.state(), JobState::Done);
    }

    #[test]
    fn test_done_after_cancel_flag_becomes_canceled() {
        let (control, mut rx) = control();
        control.begin_running();
        control.canceled.store(true, Ordering::SeqCst);
        control.finish(control.event(Stage::Done));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stage, Stage::Canceled);
    }

    #[test]
    fn test_canceled_queued_job_cannot_start() {
        let (control, mut rx) = control();
        assert!(!control.cancel());
        assert!(!control.begin_running());
        assert_eq!(control.state(), JobState::Canceled);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_sink_may_cancel_its_own_job() {
        let hub = ProgressHub::new();
        let mut rx = hub.subscribe();
        let control = Arc::new(JobControl::new(JobId::new(), JobKind::Convert, hub.clone()));
        let slot: Arc<OnceLock<Arc<JobControl>>> = Arc::default();
        let target = slot.clone();
        hub.add_sink(Arc::new(FnSink(move |event: &ProgressEvent| {
            if event.stage == Stage::Encoding {
                if let Some(control) = target.get() {
                    control.cancel();
                }
            }
        })));
        let _ = slot.set(control.clone());

        control.begin_running();
        assert!(control.emit(control.event(Stage::Encoding).with_percent(10.0)));
        assert!(!control.emit(control.event(Stage::Encoding).with_percent(20.0)));

        let stages: Vec<_> = drain(&mut rx).iter().map(|e| e.stage).collect();
        assert_eq!(stages, vec![Stage::Encoding, Stage::Canceled]);
        assert_eq!(control.state(), JobState::Canceled);
    }

    #[test]
    fn test_track_after_cancel_is_refused() {
        let (control, _rx) = control();
        control.begin_running();
        control.cancel();
        // The pid is never signalled because the tracker refuses it
        assert!(!control.track(TrackedProcess::new(u32::MAX, "ffmpeg")));
        assert_eq!(control.live_processes(), 0);
    }
}
