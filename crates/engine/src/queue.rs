//! Bounded-concurrency job queue.
//!
//! Each [`TaskQueue`] runs one [`Pipeline`] kind. Jobs wait in FIFO order
//! until a semaphore permit is free; the permit is held by the job's task
//! and released before the next admission round.

use crate::cleanup::cleanup_artifacts;
use crate::control::{lock, JobControl};
use crate::engine::EngineError;
use crate::job::{JobId, JobState};
use crate::pipeline::{JobContext, Outcome, Pipeline, PipelineEnv, PipelineError};
use crate::progress::{ProgressHub, Stage};
use crate::runner::ProcessTracker;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;

struct PendingJob<R> {
    id: JobId,
    request: R,
    control: Arc<JobControl>,
}

struct QueueInner<P: Pipeline> {
    pipeline: Arc<P>,
    env: PipelineEnv,
    semaphore: Arc<Semaphore>,
    limit: usize,
    pending: Mutex<VecDeque<PendingJob<P::Request>>>,
    jobs: Mutex<HashMap<JobId, Arc<JobControl>>>,
    hub: ProgressHub,
    runtime: Handle,
}

/// Queue of jobs for one pipeline kind.
///
/// Cheap to clone; clones share the same queue.
pub struct TaskQueue<P: Pipeline> {
    inner: Arc<QueueInner<P>>,
}

impl<P: Pipeline> Clone for TaskQueue<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Pipeline> TaskQueue<P> {
    /// Creates a queue running at most `limit` jobs at once.
    ///
    /// Must be called from within a Tokio runtime; jobs are spawned onto it.
    ///
    /// # Arguments
    /// * `pipeline` - Executes each admitted job
    /// * `env` - Tools, configuration and naming shared by all jobs
    /// * `limit` - Concurrency ceiling, at least 1
    /// * `hub` - Receives every event of every job in this queue
    pub fn new(pipeline: P, env: PipelineEnv, limit: usize, hub: ProgressHub) -> Result<Self, EngineError> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let limit = limit.max(1);
        Ok(Self {
            inner: Arc::new(QueueInner {
                pipeline: Arc::new(pipeline),
                env,
                semaphore: Arc::new(Semaphore::new(limit)),
                limit,
                pending: Mutex::new(VecDeque::new()),
                jobs: Mutex::new(HashMap::new()),
                hub,
                runtime,
            }),
        })
    }

    /// Enqueues a job and tries to admit it right away. Never blocks.
    pub fn submit(&self, request: P::Request) -> JobId {
        let id = JobId::new();
        let control = Arc::new(JobControl::new(id, P::KIND, self.inner.hub.clone()));
        lock(&self.inner.jobs).insert(id, control.clone());
        lock(&self.inner.pending).push_back(PendingJob { id, request, control });
        tracing::info!(job_id = %id, kind = %P::KIND, "job queued");

        Self::admit(&self.inner);
        id
    }

    /// Cancels a job.
    ///
    /// Publishes `canceled` for queued and running jobs alike. Returns true
    /// only when live processes were found and terminated.
    pub fn cancel(&self, id: JobId) -> bool {
        let Some(control) = lock(&self.inner.jobs).get(&id).cloned() else {
            return false;
        };
        lock(&self.inner.pending).retain(|job| job.id != id);

        let terminated = control.cancel();
        tracing::info!(job_id = %id, kind = %P::KIND, terminated, "cancel requested");
        terminated
    }

    /// Cancels every job that has not finished yet.
    pub fn cancel_all(&self) -> usize {
        let open: Vec<JobId> = lock(&self.inner.jobs)
            .iter()
            .filter(|(_, control)| !control.state().is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in &open {
            self.cancel(*id);
        }
        open.len()
    }

    /// Advisory notice that a caller no longer tracks the job.
    ///
    /// Never cancels or reorders anything. A finished job's record is
    /// forgotten so long-lived queues do not accumulate them; a queued or
    /// running job keeps its record. Returns whether the id belonged to this
    /// queue.
    pub fn remove(&self, id: JobId) -> bool {
        let mut jobs = lock(&self.inner.jobs);
        let Some(state) = jobs.get(&id).map(|control| control.state()) else {
            return false;
        };
        if state.is_terminal() {
            jobs.remove(&id);
        }
        tracing::debug!(job_id = %id, state = state.as_str(), "remove requested");
        true
    }

    pub fn state(&self, id: JobId) -> Option<JobState> {
        lock(&self.inner.jobs).get(&id).map(|control| control.state())
    }

    /// Jobs currently holding a slot
    pub fn running(&self) -> usize {
        self.inner.limit - self.inner.semaphore.available_permits()
    }

    /// Jobs waiting for a slot
    pub fn pending(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    pub fn hub(&self) -> &ProgressHub {
        &self.inner.hub
    }

    /// Admits queued jobs while slots are free.
    fn admit(inner: &Arc<QueueInner<P>>) {
        let mut pending = lock(&inner.pending);
        while !pending.is_empty() {
            let Ok(permit) = inner.semaphore.clone().try_acquire_owned() else {
                break;
            };
            let Some(job) = pending.pop_front() else {
                break;
            };
            if !job.control.begin_running() {
                // Canceled while waiting; the permit goes back with the drop
                continue;
            }
            tracing::info!(job_id = %job.id, kind = %P::KIND, "job admitted");
            let task_inner = inner.clone();
            inner.runtime.spawn(async move {
                Self::execute(&task_inner, job, permit).await;
                Self::admit(&task_inner);
            });
        }
    }

    async fn execute(inner: &Arc<QueueInner<P>>, job: PendingJob<P::Request>, permit: OwnedSemaphorePermit) {
        let control = job.control;
        let ctx = JobContext::new(control.clone(), inner.env.clone());
        let pipeline = inner.pipeline.clone();
        let request = job.request;

        // A nested task turns a panic inside the pipeline into a JoinError
        let result = match tokio::spawn(async move { pipeline.run(&ctx, &request).await }).await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::Panicked(panic_message(e))),
        };
        report_outcome(&control, result);

        let succeeded = control.state() == JobState::Done;
        let artifacts = control.take_artifacts();
        if !artifacts.is_empty() {
            let cleanup = tokio::task::spawn_blocking(move || cleanup_artifacts(&artifacts, succeeded));
            if let Err(e) = cleanup.await {
                tracing::warn!(job_id = %job.id, error = %e, "artifact cleanup did not complete");
            }
        }
        drop(permit);
    }
}

/// Converts a pipeline result into the job's terminal event.
fn report_outcome(control: &JobControl, result: Result<Outcome, PipelineError>) {
    match result {
        Ok(outcome) => {
            let mut event = control
                .event(Stage::Done)
                .with_percent(100.0)
                .with_filepath(outcome.filepath);
            if let Some(meta) = outcome.meta {
                event = event.with_meta(meta);
            }
            control.finish(event);
        }
        // Errors raised after a cancel request are swallowed
        Err(_) if control.is_canceled() => {
            control.finish(control.event(Stage::Canceled));
        }
        Err(PipelineError::Canceled) => {
            control.finish(control.event(Stage::Canceled));
        }
        Err(e) => {
            tracing::warn!(job_id = %control.id(), kind = %control.kind(), error = %e, "job failed");
            control.finish(control.event(Stage::Error).with_message(e.to_string()));
        }
    }
}

fn panic_message(e: JoinError) -> String {
    if e.is_cancelled() {
        return "job task was aborted".to_string();
    }
    let payload = e.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
