//! Worker loop: lease a job, fit it, store the result.
//!
//! One iteration:
//!
//! ```text
//! Idle -> Leased -> Fitting -> Succeeded                 -> complete
//!                          \-> Failed (numerical)        -> requeue (Accepted | Rejected)
//!                          \-> Failed (anything else)    -> abandon
//! ```
//!
//! Workers are independent: any number of processes can run the loop against
//! the same queue and cache. Each worker fits one job at a time.

use std::time::Duration;

use crate::cache::ModelCache;
use crate::data::{RasterProvider, RasterRequest};
use crate::domain::{Job, RequeueOutcome};
use crate::error::{FitError, QueueError, StoreError};
use crate::fit::{FitContext, Fitter};
use crate::queue::JobQueue;

/// What happened to one leased job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Fitted and stored.
    Succeeded,
    /// Another worker stored the model first; the job completed without a new artifact.
    AlreadyCached,
    /// Numerical failure, handed back for another attempt.
    Retried,
    /// Numerical failure with no attempts left; the job is abandoned.
    Exhausted,
    /// Non-retryable failure; the job is abandoned.
    Abandoned,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerLimits {
    /// Stop after this many leased jobs.
    pub max_jobs: Option<usize>,
    /// Stop at the first empty poll instead of waiting for new jobs.
    pub exit_when_empty: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub succeeded: usize,
    pub retried: usize,
    /// Numerical failures that spent the retry budget.
    pub failed: usize,
    pub abandoned: usize,
    pub queue_errors: usize,
}

impl WorkerSummary {
    pub fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Succeeded | JobOutcome::AlreadyCached => self.succeeded += 1,
            JobOutcome::Retried => self.retried += 1,
            JobOutcome::Exhausted => self.failed += 1,
            JobOutcome::Abandoned => self.abandoned += 1,
        }
    }

    /// Jobs leased and handled.
    pub fn processed(&self) -> usize {
        self.succeeded + self.retried + self.failed + self.abandoned
    }
}

pub struct Worker<'a> {
    queue: &'a dyn JobQueue,
    cache: &'a dyn ModelCache,
    fitter: &'a dyn Fitter,
    provider: &'a dyn RasterProvider,
    poll_interval: Duration,
}

impl<'a> Worker<'a> {
    pub const DEFAULT_POLL: Duration = Duration::from_secs(5);

    pub fn new(
        queue: &'a dyn JobQueue,
        cache: &'a dyn ModelCache,
        fitter: &'a dyn Fitter,
        provider: &'a dyn RasterProvider,
    ) -> Self {
        Self {
            queue,
            cache,
            fitter,
            provider,
            poll_interval: Self::DEFAULT_POLL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run until `limits` say stop. Queue errors are logged and backed off, never fatal.
    pub fn run(&self, limits: WorkerLimits) -> WorkerSummary {
        let mut summary = WorkerSummary::default();
        tracing::info!(poll_ms = self.poll_interval.as_millis() as u64, "worker started");

        loop {
            if limits.max_jobs.is_some_and(|max| summary.processed() >= max) {
                break;
            }
            match self.step() {
                Ok(Some(outcome)) => summary.record(outcome),
                Ok(None) => {
                    if limits.exit_when_empty {
                        break;
                    }
                    std::thread::sleep(self.poll_interval);
                }
                Err(e) => {
                    summary.queue_errors += 1;
                    tracing::error!(error = %e, "queue error, backing off");
                    std::thread::sleep(self.poll_interval);
                }
            }
        }

        tracing::info!(
            succeeded = summary.succeeded,
            retried = summary.retried,
            failed = summary.failed,
            abandoned = summary.abandoned,
            "worker stopped"
        );
        summary
    }

    /// Lease and handle at most one job. `Ok(None)` when nothing is pending.
    pub fn step(&self) -> Result<Option<JobOutcome>, QueueError> {
        let Some(job) = self.queue.lease()? else {
            return Ok(None);
        };
        let span = tracing::info_span!("job", job = %job.id, key = %job.key, attempt = job.attempts);
        let _entered = span.enter();
        self.handle(&job).map(Some)
    }

    fn handle(&self, job: &Job) -> Result<JobOutcome, QueueError> {
        let key = &job.key;

        match self.cache.exists(key) {
            Ok(true) => {
                tracing::info!("model already cached, skipping fit");
                self.queue.complete(&job.id)?;
                return Ok(JobOutcome::AlreadyCached);
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "cache check failed, fitting anyway"),
        }

        let raster = match self.provider.load(&RasterRequest::for_key(key)) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "cannot load raster, abandoning job");
                self.queue.abandon(&job.id, &e.to_string())?;
                return Ok(JobOutcome::Abandoned);
            }
        };

        let ctx = FitContext {
            attempt: job.attempts,
            verbose: job.verbose,
        };
        match self.fitter.fit(key, &raster, ctx) {
            Ok(model) => match self.cache.store(key, &model, false) {
                Ok(()) => {
                    tracing::info!(log_likelihood = model.log_likelihood, iterations = model.iterations, "model stored");
                    self.queue.complete(&job.id)?;
                    Ok(JobOutcome::Succeeded)
                }
                Err(StoreError::AlreadyExists(_)) => {
                    tracing::info!("model already cached by another worker");
                    self.queue.complete(&job.id)?;
                    Ok(JobOutcome::AlreadyCached)
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to store model, abandoning job");
                    self.queue.abandon(&job.id, &e.to_string())?;
                    Ok(JobOutcome::Abandoned)
                }
            },
            Err(e @ FitError::Numerical(_)) => match self.queue.requeue(&job.id, &e.to_string())? {
                RequeueOutcome::Accepted => {
                    tracing::warn!(key = %key, error = %e, "optimization failed, retrying");
                    Ok(JobOutcome::Retried)
                }
                RequeueOutcome::Rejected => {
                    tracing::warn!(key = %key, attempts = job.attempts, error = %e, "optimization failed");
                    Ok(JobOutcome::Exhausted)
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "unexpected non-retryable fit failure, abandoning job");
                self.queue.abandon(&job.id, &e.to_string())?;
                Ok(JobOutcome::Abandoned)
            }
        }
    }
}
