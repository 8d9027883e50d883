//! Durable queue of fitting jobs shared by worker processes.
//!
//! Job lifecycle:
//!
//! ```text
//! enqueue -> Pending --lease--> Leased --complete--> (removed)
//!                ^                 |
//!                +---- requeue ----+ (while attempts < max_attempts)
//!                                  |
//!                                  +--> Abandoned (requeue rejected, or abandon)
//! ```
//!
//! At most one job per key is leased at any time; duplicates wait in pending.
//! `attempts` counts fit attempts started and is incremented on every lease,
//! so it never exceeds the policy's `max_attempts`. Abandoned jobs are kept
//! for inspection and never leased again.

pub mod fs;
pub mod memory;

pub use fs::FsJobQueue;
pub use memory::MemoryJobQueue;

use chrono::{DateTime, Duration, Utc};

use crate::domain::{Job, JobId, JobState, ModelKey, RequeueOutcome, RetryPolicy};
use crate::error::QueueError;

/// Point-in-time listing of every job in the queue, each list sorted by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    pub pending: Vec<Job>,
    pub leased: Vec<Job>,
    pub abandoned: Vec<Job>,
}

impl QueueSnapshot {
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.leased.is_empty()
    }

    pub fn total(&self) -> usize {
        self.pending.len() + self.leased.len() + self.abandoned.len()
    }
}

pub trait JobQueue: Send + Sync {
    fn policy(&self) -> RetryPolicy;

    /// Add a pending job. Duplicate keys are allowed; the cache deduplicates.
    fn enqueue(&self, key: &ModelKey, verbose: bool) -> Result<JobId, QueueError>;

    /// Atomically take one pending job, or `None` when nothing is leasable.
    ///
    /// A pending job whose key already has a leased job is skipped, so one key
    /// is never fitted by two workers at once.
    ///
    /// The returned job has `attempts` already incremented and `leased_at` set.
    fn lease(&self) -> Result<Option<Job>, QueueError>;

    /// Remove a leased job after success.
    fn complete(&self, id: &JobId) -> Result<(), QueueError>;

    /// Hand a failed leased job back. `Accepted` puts it back to pending;
    /// `Rejected` means the retry budget is spent and it is now abandoned.
    fn requeue(&self, id: &JobId, reason: &str) -> Result<RequeueOutcome, QueueError>;

    /// Move a leased job straight to abandoned (non-retryable failure).
    fn abandon(&self, id: &JobId, reason: &str) -> Result<(), QueueError>;

    /// Current state of a job; `None` once it completed (or never existed).
    fn state(&self, id: &JobId) -> Result<Option<JobState>, QueueError>;

    fn snapshot(&self) -> Result<QueueSnapshot, QueueError>;

    /// Return leases older than `older_than` to pending without charging an
    /// attempt. Operator-triggered only: a slow fit is indistinguishable from
    /// a dead worker.
    fn reclaim_stale(&self, older_than: Duration) -> Result<usize, QueueError>;
}

/// Apply a failed attempt to `job`; returns where it goes next.
fn record_failure(job: &mut Job, reason: &str, policy: RetryPolicy) -> RequeueOutcome {
    job.last_error = Some(reason.to_string());
    job.leased_at = None;
    if policy.allows_retry(job.attempts) {
        RequeueOutcome::Accepted
    } else {
        RequeueOutcome::Rejected
    }
}

fn mark_leased(job: &mut Job, now: DateTime<Utc>) {
    job.attempts += 1;
    job.leased_at = Some(now);
}

/// Lease older than `cutoff`. A job without `leased_at` is mid-lease and
/// never stale by this test.
fn is_stale(job: &Job, cutoff: DateTime<Utc>) -> bool {
    job.leased_at.is_some_and(|at| at <= cutoff)
}

/// Return a lease without charging for it. Only a stamped lease has charged an attempt.
fn unlease(job: &mut Job) {
    if job.leased_at.take().is_some() {
        job.attempts = job.attempts.saturating_sub(1);
    }
}
