//! Job manager implementation
//!
//! Owns the job table and the slot pool. A job is created by `submit`, runs
//! while holding a slot, and stays in the table after it finishes until the
//! caller takes its result.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use common::error::{Error, Result};
use common::models::{Image, JobId, JobState};
use settings::JobSettings;

use crate::context::JobContext;
use crate::job::{JobInfo, JobOptions, JobResult, JobSnapshot};
use crate::slots::{JobSlotPool, SlotPolicy};

/// Bounded tracker of generation jobs
pub struct JobManager {
    /// Job table
    jobs: DashMap<JobId, Arc<JobInfo>>,

    /// Slot pool
    pool: JobSlotPool,

    /// Slot acquisition policy
    policy: SlotPolicy,

    /// Options for jobs submitted without explicit ones
    default_options: JobOptions,
}

impl JobManager {
    /// Creates a job manager
    pub fn new(max_jobs: usize, policy: SlotPolicy, default_options: JobOptions) -> Result<Self> {
        info!("Creating job manager with {} slot(s), policy {:?}", max_jobs, policy);

        Ok(Self {
            jobs: DashMap::new(),
            pool: JobSlotPool::new(max_jobs)?,
            policy,
            default_options,
        })
    }

    /// Creates a job manager from job settings
    pub fn from_settings(settings: &JobSettings) -> Result<Self> {
        Self::new(
            settings.max_concurrent_jobs,
            SlotPolicy::from_settings(settings),
            JobOptions::from_settings(settings),
        )
    }

    /// Gets the configured maximum of concurrent jobs
    pub fn max_jobs(&self) -> usize {
        self.pool.max_jobs()
    }

    /// Gets the number of free slots
    pub fn available_slots(&self) -> usize {
        self.pool.available()
    }

    /// Gets the default job options
    pub fn default_options(&self) -> &JobOptions {
        &self.default_options
    }

    /// Submits a job with the default options
    pub async fn submit(&self) -> Result<JobHandle> {
        self.submit_with(self.default_options.clone()).await
    }

    /// Submits a job, reserving a slot according to the manager's policy.
    ///
    /// The job is observable as `Queued` while it waits and is removed from
    /// the table if no slot is obtained.
    pub async fn submit_with(&self, options: JobOptions) -> Result<JobHandle> {
        let info = Arc::new(JobInfo::new(options));
        let id = info.id();
        self.jobs.insert(id, info.clone());

        let mut queued = QueuedEntry {
            jobs: &self.jobs,
            id,
            armed: true,
        };

        debug!("Job {} queued, {} slot(s) free", id, self.pool.available());

        let token = info.cancellation_token();
        let slot = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::JobCancelled(id)),
            slot = self.pool.acquire(self.policy) => slot?,
        };

        info.attach_slot(slot);
        info.transition(JobState::Running)?;
        queued.armed = false;

        info!("Job {} started", id);

        Ok(JobHandle { info })
    }

    /// Returns a job's slot to the pool; fails on a second call
    pub fn release(&self, id: &JobId) -> Result<()> {
        self.job(id)?.release_slot()
    }

    /// Requests cooperative cancellation of a job
    pub fn request_cancel(&self, id: &JobId) -> Result<()> {
        self.job(id)?.cancel();
        Ok(())
    }

    /// Asks a job to abandon its current iteration
    pub fn request_skip(&self, id: &JobId) -> Result<()> {
        let info = self.job(id)?;
        info!("Skip requested for job {}", id);
        info.request_skip();
        Ok(())
    }

    /// Waits for the job's next checkpoint to render a preview
    pub async fn request_preview(&self, id: &JobId, timeout: Duration) -> Result<Image> {
        let info = self.job(id)?;
        info.request_preview(timeout).await
    }

    /// Replaces a job's status line
    pub fn set_status(&self, id: &JobId, text: impl Into<String>) -> Result<()> {
        self.job(id)?.set_status(text);
        Ok(())
    }

    /// Appends a recorded preview to a job
    pub fn record_preview(&self, id: &JobId, image: Image) -> Result<()> {
        self.job(id)?.record_preview(image);
        Ok(())
    }

    /// Gets a job's shared state
    pub fn job(&self, id: &JobId) -> Result<Arc<JobInfo>> {
        self.jobs
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(Error::JobNotFound(*id))
    }

    /// Gets a serializable view of a job
    pub fn snapshot(&self, id: &JobId) -> Result<JobSnapshot> {
        Ok(self.job(id)?.snapshot())
    }

    /// Gets a view of every job, oldest first
    pub fn list(&self) -> Vec<JobSnapshot> {
        let jobs: Vec<Arc<JobInfo>> = self.jobs.iter().map(|entry| entry.value().clone()).collect();
        let mut snapshots: Vec<JobSnapshot> = jobs.iter().map(|info| info.snapshot()).collect();
        snapshots.sort_by_key(|snapshot| snapshot.created_at);
        snapshots
    }

    /// Subscribes to a job's state changes
    pub fn subscribe(&self, id: &JobId) -> Result<watch::Receiver<JobState>> {
        Ok(self.job(id)?.subscribe())
    }

    /// Waits until a job reaches a terminal state
    pub async fn wait(&self, id: &JobId) -> Result<JobState> {
        let mut receiver = self.subscribe(id)?;
        loop {
            let state = receiver.borrow_and_update().clone();
            if state.is_terminal() {
                return Ok(state);
            }
            if receiver.changed().await.is_err() {
                return Ok(receiver.borrow().clone());
            }
        }
    }

    /// Runs a worker on the tokio runtime
    pub fn spawn<F, Fut>(&self, handle: JobHandle, work: F) -> JoinHandle<JobState>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        tokio::spawn(handle.run(work))
    }

    /// Removes a finished job from the table and returns its outcome
    pub fn take_result(&self, id: &JobId) -> Result<JobResult> {
        let removed = self
            .jobs
            .remove_if(id, |_, info| info.state().is_terminal());

        match removed {
            Some((_, info)) => Ok(info.to_result()),
            None if self.jobs.contains_key(id) => Err(Error::InvalidArgument(format!(
                "Job {} has not finished",
                id
            ))),
            None => Err(Error::JobNotFound(*id)),
        }
    }
}

/// Removes a job that never obtained a slot from the table
struct QueuedEntry<'a> {
    jobs: &'a DashMap<JobId, Arc<JobInfo>>,
    id: JobId,
    armed: bool,
}

impl Drop for QueuedEntry<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Job {} left the queue without a slot", self.id);
            self.jobs.remove(&self.id);
        }
    }
}

/// Owner of a running job.
///
/// Dropping the handle of a job that has not finished cancels it and
/// returns its slot.
pub struct JobHandle {
    info: Arc<JobInfo>,
}

impl JobHandle {
    /// Gets the job id
    pub fn id(&self) -> JobId {
        self.info.id()
    }

    /// Gets the shared job state
    pub fn info(&self) -> &Arc<JobInfo> {
        &self.info
    }

    /// Gets a worker context for the job
    pub fn context(&self) -> JobContext {
        JobContext::new(self.info.clone())
    }

    /// Runs `work` to completion and moves the job to its terminal state.
    ///
    /// `Ok` completes the job, `Error::JobCancelled` cancels it, any other
    /// error or a panic fails it. The slot is released on every path.
    pub async fn run<F, Fut>(self, work: F) -> JobState
    where
        F: FnOnce(JobContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let id = self.id();
        let outcome = AssertUnwindSafe(work(self.context())).catch_unwind().await;

        let state = match outcome {
            Ok(Ok(())) => JobState::Completed,
            Ok(Err(Error::JobCancelled(_))) => JobState::Cancelled,
            Ok(Err(e)) => {
                error!("Job {} failed: {}", id, e);
                JobState::Failed(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                error!("Job {} panicked: {}", id, message);
                JobState::Failed(format!("worker panicked: {}", message))
            }
        };

        self.finish(state)
    }

    /// Moves the job to a terminal state and releases its slot
    pub fn finish(&self, state: JobState) -> JobState {
        if let Err(e) = self.info.transition(state) {
            warn!("Job {} could not finish: {}", self.id(), e);
        }

        if let Err(e) = self.info.release_slot() {
            debug!("Job {}: {}", self.id(), e);
        }

        self.info.state()
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id())
            .field("state", &self.info.state())
            .finish()
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if !self.info.state().is_terminal() {
            warn!("Handle of unfinished job {} dropped, cancelling", self.id());
            self.info.cancel();
            let _ = self.info.transition(JobState::Cancelled);
        }

        let _ = self.info.release_slot();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
