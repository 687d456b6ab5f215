//! Worker-side view of a running job

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use common::error::{Error, Result};
use common::models::{Image, JobId};

use crate::job::JobInfo;

/// Handed to the worker of a job.
///
/// The worker reports progress through it and calls [`JobContext::checkpoint`]
/// once per sampling iteration.
#[derive(Clone)]
pub struct JobContext {
    info: Arc<JobInfo>,
}

impl JobContext {
    pub(crate) fn new(info: Arc<JobInfo>) -> Self {
        Self { info }
    }

    /// Gets the job id
    pub fn id(&self) -> JobId {
        self.info.id()
    }

    /// Gets the shared job state
    pub fn info(&self) -> &Arc<JobInfo> {
        &self.info
    }

    /// Returns true once cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.info.is_cancelled()
    }

    /// Fails with `Error::JobCancelled` if cancellation was requested
    pub fn check_cancelled(&self) -> Result<()> {
        if self.info.is_cancelled() {
            return Err(Error::JobCancelled(self.info.id()));
        }
        Ok(())
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        self.info.cancellation_token().cancelled().await
    }

    /// Replaces the status line
    pub fn set_status(&self, text: impl Into<String>) {
        self.info.set_status(text);
    }

    /// Starts a new batch iteration
    pub fn begin_iteration(&self) {
        self.info.begin_iteration();
    }

    /// Appends a final output image
    pub fn push_output(&self, image: Image) {
        self.info.push_output(image);
    }

    /// Sampling checkpoint.
    ///
    /// Fails with `Error::JobCancelled` on a cancellation request and with
    /// `Error::IterationSkipped` on a pending skip request, which is consumed.
    /// Otherwise records the iteration and, when a preview is due for
    /// recording or awaited by a requester, renders one through `render`.
    pub async fn checkpoint<F, Fut>(&self, iteration: u64, render: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Image>>,
    {
        self.check_cancelled()?;

        if self.info.take_skip() {
            debug!("Job {} skipping its current iteration", self.id());
            return Err(Error::IterationSkipped);
        }

        self.info.set_active_iteration(iteration);

        let options = self.info.options();
        let interval = options.preview_interval.max(1);
        let record = options.record_steps && iteration % interval == 0;
        let refresh = self.info.preview_requested();

        if !record && !refresh {
            return Ok(());
        }

        let started = Instant::now();
        let image = render().await?;
        let elapsed = started.elapsed();

        // More than a second per interval step means previews dominate sampling
        if elapsed.as_secs_f64() / interval as f64 > 1.0 {
            warn!(
                "Preview generation is slowing job {}: rendering took {}",
                self.id(),
                common::utils::format_duration(elapsed)
            );
        }

        if record {
            self.info.record_preview(image.clone());
        }

        if refresh {
            let served = self.info.fulfil_preview(image);
            debug!("Job {} served a preview to {} requester(s)", self.id(), served);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use common::models::JobState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn context(options: JobOptions) -> JobContext {
        let info = Arc::new(JobInfo::new(options));
        info.transition(JobState::Running).unwrap();
        JobContext::new(info)
    }

    fn blank() -> Image {
        Arc::new(image::RgbImage::new(1, 1))
    }

    #[tokio::test]
    async fn test_checkpoint_records_on_interval() {
        let ctx = context(JobOptions::default().recording(3));
        let counter = AtomicUsize::new(0);
        let renders = &counter;

        for iteration in 0..10 {
            ctx.checkpoint(iteration, || async move {
                renders.fetch_add(1, Ordering::SeqCst);
                Ok(blank())
            })
            .await
            .unwrap();
        }

        // Iterations 0, 3, 6 and 9
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(ctx.info().recorded_previews().len(), 4);
        assert_eq!(ctx.info().active_iteration(), 9);
    }

    #[tokio::test]
    async fn test_checkpoint_treats_zero_interval_as_every_iteration() {
        let ctx = context(JobOptions {
            record_steps: true,
            preview_interval: 0,
            max_recorded_previews: 4,
        });

        for iteration in 0..3 {
            ctx.checkpoint(iteration, || async { Ok(blank()) }).await.unwrap();
        }
        assert_eq!(ctx.info().recorded_previews().len(), 3);
    }

    #[tokio::test]
    async fn test_checkpoint_without_recording_never_renders() {
        let ctx = context(JobOptions::default());
        for iteration in 0..20 {
            ctx.checkpoint(iteration, || async {
                Err(Error::Internal("rendered without a request".to_string()))
            })
            .await
            .unwrap();
        }
        assert!(ctx.info().recorded_previews().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_observes_cancel_and_skip() {
        let ctx = context(JobOptions::default());

        ctx.info().request_skip();
        let err = ctx.checkpoint(1, || async { Ok(blank()) }).await.unwrap_err();
        assert!(err.is_iteration_skipped());
        ctx.checkpoint(2, || async { Ok(blank()) }).await.unwrap();

        ctx.info().cancel();
        let err = ctx.checkpoint(3, || async { Ok(blank()) }).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(ctx.info().active_iteration(), 2);
    }

    #[tokio::test]
    async fn test_checkpoint_serves_preview_request() {
        let ctx = context(JobOptions::default());

        let requester = {
            let info = ctx.info().clone();
            tokio::spawn(async move { info.request_preview(Duration::from_secs(5)).await })
        };
        while !ctx.info().preview_requested() {
            tokio::task::yield_now().await;
        }

        ctx.checkpoint(4, || async { Ok(blank()) }).await.unwrap();
        let image = requester.await.unwrap().unwrap();
        assert_eq!(image.dimensions(), (1, 1));
        assert!(ctx.info().recorded_previews().is_empty());
    }
}
