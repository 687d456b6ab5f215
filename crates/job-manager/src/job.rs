//! Per-job state
//!
//! [`JobInfo`] is shared between the worker running a job and any number of
//! observers. Scalar fields have a single writer (the worker, or the
//! requester for the cancel and skip flags); the preview buffer and the
//! on-demand preview rendezvous go through locks and oneshot channels.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::models::{Image, JobId, JobState};
use common::utils::format_duration;
use settings::JobSettings;

use crate::slots::JobSlot;

/// Preview recording options of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Record a preview every `preview_interval` iterations
    pub record_steps: bool,
    /// Checkpoint interval between recorded previews
    pub preview_interval: u64,
    /// Bound of the recorded preview buffer; oldest previews are dropped first
    pub max_recorded_previews: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            record_steps: false,
            preview_interval: 10,
            max_recorded_previews: 32,
        }
    }
}

impl JobOptions {
    /// Builds the default options from job settings
    pub fn from_settings(settings: &JobSettings) -> Self {
        Self {
            record_steps: settings.record_steps,
            preview_interval: settings.preview_interval.max(1),
            max_recorded_previews: settings.max_recorded_previews.max(1),
        }
    }

    /// Enables periodic preview recording
    pub fn recording(mut self, interval: u64) -> Self {
        self.record_steps = true;
        self.preview_interval = interval.max(1);
        self
    }
}

/// Mutable state of one generation job
pub struct JobInfo {
    id: JobId,
    options: JobOptions,
    created_at: DateTime<Utc>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,

    /// Lifecycle state, observable through `subscribe`
    state: watch::Sender<JobState>,

    /// Human readable progress line
    status: RwLock<String>,

    cancel: CancellationToken,

    /// Abandon the current iteration only
    skip_requested: AtomicBool,

    active_iteration: AtomicU64,

    /// Periodic previews of the current batch iteration
    recorded: Mutex<VecDeque<Image>>,

    /// Requesters waiting for the next checkpoint image
    preview_waiters: Mutex<Vec<oneshot::Sender<Image>>>,

    outputs: Mutex<Vec<Image>>,

    slot: Mutex<Option<JobSlot>>,
    released: AtomicBool,
}

impl JobInfo {
    /// Creates a queued job
    pub fn new(options: JobOptions) -> Self {
        let (state, _) = watch::channel(JobState::Queued);

        Self {
            id: JobId::new(),
            options,
            created_at: Utc::now(),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
            state,
            status: RwLock::new(String::new()),
            cancel: CancellationToken::new(),
            skip_requested: AtomicBool::new(false),
            active_iteration: AtomicU64::new(0),
            recorded: Mutex::new(VecDeque::new()),
            preview_waiters: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
            slot: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    /// Gets the job id
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Gets the recording options
    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    /// Gets the current state
    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Subscribes to state changes
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    /// Moves the state machine forward.
    ///
    /// Terminal states wake every pending preview requester.
    pub fn transition(&self, next: JobState) -> Result<()> {
        let mut rejected = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                *current = next.clone();
                true
            } else {
                rejected = Some(current.to_string());
                false
            }
        });

        if let Some(from) = rejected {
            return Err(Error::InvalidTransition {
                job: self.id,
                from,
                to: next.to_string(),
            });
        }

        match &next {
            JobState::Running => *self.started_at.lock() = Some(Utc::now()),
            state if state.is_terminal() => {
                *self.finished_at.lock() = Some(Utc::now());
                self.preview_waiters.lock().clear();
            }
            _ => {}
        }

        info!("Job {} is now {}", self.id, next);
        Ok(())
    }

    /// Gets the status line
    pub fn status(&self) -> String {
        self.status.read().clone()
    }

    /// Replaces the status line
    pub fn set_status(&self, text: impl Into<String>) {
        let text = text.into();
        debug!("Job {}: {}", self.id, text);
        *self.status.write() = text;
    }

    /// Requests cooperative cancellation
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!("Cancellation requested for job {}", self.id);
            self.cancel.cancel();
        }
    }

    /// Returns true once cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Gets the cancellation token
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Asks the worker to abandon its current iteration
    pub fn request_skip(&self) {
        self.skip_requested.store(true, Ordering::SeqCst);
    }

    /// Consumes a pending skip request
    pub fn take_skip(&self) -> bool {
        self.skip_requested.swap(false, Ordering::SeqCst)
    }

    /// Gets the last checkpointed sampling iteration
    pub fn active_iteration(&self) -> u64 {
        self.active_iteration.load(Ordering::SeqCst)
    }

    /// Records the current sampling iteration
    pub fn set_active_iteration(&self, iteration: u64) {
        self.active_iteration.store(iteration, Ordering::SeqCst);
    }

    /// Appends a recorded preview, dropping the oldest beyond the bound
    pub fn record_preview(&self, image: Image) {
        let mut recorded = self.recorded.lock();
        recorded.push_back(image);
        while recorded.len() > self.options.max_recorded_previews {
            recorded.pop_front();
        }
    }

    /// Gets the recorded previews, oldest first
    pub fn recorded_previews(&self) -> Vec<Image> {
        self.recorded.lock().iter().cloned().collect()
    }

    /// Starts a new batch iteration, clearing the recorded previews
    pub fn begin_iteration(&self) {
        self.recorded.lock().clear();
        self.set_active_iteration(0);
    }

    /// Appends a final output image
    pub fn push_output(&self, image: Image) {
        self.outputs.lock().push(image);
    }

    /// Gets the output images
    pub fn outputs(&self) -> Vec<Image> {
        self.outputs.lock().clone()
    }

    /// Returns true if an on-demand preview is awaited
    pub fn preview_requested(&self) -> bool {
        let mut waiters = self.preview_waiters.lock();
        waiters.retain(|waiter| !waiter.is_closed());
        !waiters.is_empty()
    }

    /// Hands a rendered preview to every waiting requester.
    ///
    /// Returns the number of requesters served.
    pub fn fulfil_preview(&self, image: Image) -> usize {
        let waiters: Vec<_> = self.preview_waiters.lock().drain(..).collect();
        waiters
            .into_iter()
            .filter_map(|waiter| waiter.send(image.clone()).ok())
            .count()
    }

    /// Waits for the worker's next checkpoint to render a preview.
    ///
    /// Concurrent requests share the same rendezvous.
    pub async fn request_preview(&self, timeout: Duration) -> Result<Image> {
        let receiver = {
            let mut waiters = self.preview_waiters.lock();
            if self.state().is_terminal() {
                return Err(Error::PreviewUnavailable(format!(
                    "job {} has finished",
                    self.id
                )));
            }
            let (sender, receiver) = oneshot::channel();
            waiters.push(sender);
            receiver
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(image)) => Ok(image),
            Ok(Err(_)) => Err(Error::PreviewUnavailable(format!(
                "job {} finished before its next checkpoint",
                self.id
            ))),
            Err(_) => {
                warn!(
                    "Job {} did not reach a checkpoint within {}",
                    self.id,
                    format_duration(timeout)
                );
                Err(Error::Timeout(format!(
                    "No preview from job {} within {}",
                    self.id,
                    format_duration(timeout)
                )))
            }
        }
    }

    /// Stores the reserved slot
    pub(crate) fn attach_slot(&self, slot: JobSlot) {
        *self.slot.lock() = Some(slot);
    }

    /// Returns the slot to the pool.
    ///
    /// Succeeds exactly once; later calls fail with `Error::JobAlreadyReleased`.
    pub fn release_slot(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Err(Error::JobAlreadyReleased(self.id));
        }

        drop(self.slot.lock().take());
        debug!("Job {} released its slot", self.id);
        Ok(())
    }

    /// Returns true once the slot went back to the pool
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Gets a serializable view of the job
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            state: self.state(),
            status: self.status(),
            active_iteration: self.active_iteration(),
            recorded_previews: self.recorded.lock().len(),
            outputs: self.outputs.lock().len(),
            preview_pending: self.preview_requested(),
            cancel_requested: self.is_cancelled(),
            released: self.is_released(),
            created_at: self.created_at,
            started_at: *self.started_at.lock(),
            finished_at: *self.finished_at.lock(),
        }
    }

    /// Converts a finished job into its result
    pub(crate) fn to_result(&self) -> JobResult {
        JobResult {
            id: self.id,
            state: self.state(),
            status: self.status(),
            outputs: self.outputs(),
            elapsed: self.elapsed(),
        }
    }

    fn elapsed(&self) -> Option<Duration> {
        let started = (*self.started_at.lock())?;
        let finished = (*self.finished_at.lock())?;
        (finished - started).to_std().ok()
    }
}

/// Point-in-time view of a job for polling observers
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    /// Job id
    pub id: JobId,
    /// Lifecycle state
    pub state: JobState,
    /// Status line
    pub status: String,
    /// Last checkpointed sampling iteration
    pub active_iteration: u64,
    /// Number of recorded previews
    pub recorded_previews: usize,
    /// Number of output images
    pub outputs: usize,
    /// An on-demand preview is awaited
    pub preview_pending: bool,
    /// Cancellation was requested
    pub cancel_requested: bool,
    /// The slot went back to the pool
    pub released: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time the job got its slot
    pub started_at: Option<DateTime<Utc>>,
    /// Time the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

/// Final outcome of a job, handed over by `JobManager::take_result`
#[derive(Debug, Clone)]
pub struct JobResult {
    /// Job id
    pub id: JobId,
    /// Terminal state
    pub state: JobState,
    /// Last status line
    pub status: String,
    /// Output images
    pub outputs: Vec<Image>,
    /// Running time
    pub elapsed: Option<Duration>,
}
