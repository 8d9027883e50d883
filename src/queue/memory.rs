//! In-process job queue behind a single mutex.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::{Duration, Utc};

use crate::domain::{Job, JobId, JobState, ModelKey, RequeueOutcome, RetryPolicy};
use crate::error::QueueError;
use crate::queue::{JobQueue, QueueSnapshot, is_stale, mark_leased, record_failure, unlease};

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<Job>,
    leased: BTreeMap<JobId, Job>,
    abandoned: BTreeMap<JobId, Job>,
}

#[derive(Debug)]
pub struct MemoryJobQueue {
    policy: RetryPolicy,
    state: Mutex<State>,
}

impl MemoryJobQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(State::default()),
        }
    }

    fn take_leased(state: &mut State, id: &JobId) -> Result<Job, QueueError> {
        state
            .leased
            .remove(id)
            .ok_or_else(|| QueueError::UnknownJob(id.clone()))
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl JobQueue for MemoryJobQueue {
    fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn enqueue(&self, key: &ModelKey, verbose: bool) -> Result<JobId, QueueError> {
        let job = Job::new(key.clone(), verbose);
        let id = job.id.clone();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending.push_back(job);
        Ok(id)
    }

    fn lease(&self) -> Result<Option<Job>, QueueError> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        let free = state
            .pending
            .iter()
            .position(|job| !state.leased.values().any(|held| held.key == job.key));
        let Some(mut job) = free.and_then(|pos| state.pending.remove(pos)) else {
            return Ok(None);
        };
        mark_leased(&mut job, Utc::now());
        state.leased.insert(job.id.clone(), job.clone());
        Ok(Some(job))
    }

    fn complete(&self, id: &JobId) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Self::take_leased(&mut state, id).map(|_| ())
    }

    fn requeue(&self, id: &JobId, reason: &str) -> Result<RequeueOutcome, QueueError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut job = Self::take_leased(&mut state, id)?;
        let outcome = record_failure(&mut job, reason, self.policy);
        match outcome {
            RequeueOutcome::Accepted => state.pending.push_back(job),
            RequeueOutcome::Rejected => {
                state.abandoned.insert(job.id.clone(), job);
            }
        }
        Ok(outcome)
    }

    fn abandon(&self, id: &JobId, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut job = Self::take_leased(&mut state, id)?;
        job.last_error = Some(reason.to_string());
        job.leased_at = None;
        state.abandoned.insert(job.id.clone(), job);
        Ok(())
    }

    fn state(&self, id: &JobId) -> Result<Option<JobState>, QueueError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.leased.contains_key(id) {
            Ok(Some(JobState::Leased))
        } else if state.abandoned.contains_key(id) {
            Ok(Some(JobState::Abandoned))
        } else if state.pending.iter().any(|j| &j.id == id) {
            Ok(Some(JobState::Pending))
        } else {
            Ok(None)
        }
    }

    fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pending: Vec<Job> = state.pending.iter().cloned().collect();
        pending.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(QueueSnapshot {
            pending,
            leased: state.leased.values().cloned().collect(),
            abandoned: state.abandoned.values().cloned().collect(),
        })
    }

    fn reclaim_stale(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now() - older_than;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<JobId> = state
            .leased
            .values()
            .filter(|job| is_stale(job, cutoff))
            .map(|job| job.id.clone())
            .collect();
        for id in &stale {
            if let Some(mut job) = state.leased.remove(id) {
                unlease(&mut job);
                state.pending.push_back(job);
            }
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::key;

    #[test]
    fn lease_is_fifo_and_counts_attempts() {
        let q = MemoryJobQueue::default();
        let a = q.enqueue(&key("e1", 10), false).unwrap();
        let b = q.enqueue(&key("e2", 10), true).unwrap();

        let job = q.lease().unwrap().unwrap();
        assert_eq!(job.id, a);
        assert_eq!(job.attempts, 1);
        assert!(job.leased_at.is_some());
        assert_eq!(q.state(&a).unwrap(), Some(JobState::Leased));
        assert_eq!(q.state(&b).unwrap(), Some(JobState::Pending));

        q.complete(&a).unwrap();
        assert_eq!(q.state(&a).unwrap(), None);
        assert!(matches!(q.complete(&a), Err(QueueError::UnknownJob(_))));
    }

    #[test]
    fn duplicate_key_waits_for_the_leased_job() {
        let q = MemoryJobQueue::default();
        let first = q.enqueue(&key("e1", 10), false).unwrap();
        let second = q.enqueue(&key("e1", 10), false).unwrap();

        assert_eq!(q.lease().unwrap().unwrap().id, first);
        assert!(q.lease().unwrap().is_none());
        q.complete(&first).unwrap();
        assert_eq!(q.lease().unwrap().unwrap().id, second);
    }

    #[test]
    fn requeue_is_bounded_by_policy() {
        let q = MemoryJobQueue::new(RetryPolicy::new(3));
        let id = q.enqueue(&key("e1", 10), false).unwrap();

        let mut outcomes = Vec::new();
        while let Some(job) = q.lease().unwrap() {
            outcomes.push(q.requeue(&job.id, "zero division").unwrap());
        }
        assert_eq!(
            outcomes,
            vec![RequeueOutcome::Accepted, RequeueOutcome::Accepted, RequeueOutcome::Rejected]
        );
        assert_eq!(q.state(&id).unwrap(), Some(JobState::Abandoned));

        let snap = q.snapshot().unwrap();
        assert_eq!(snap.abandoned[0].attempts, 3);
        assert_eq!(snap.abandoned[0].last_error.as_deref(), Some("zero division"));
        assert!(snap.is_idle());
    }

    #[test]
    fn reclaim_returns_lease_without_charging_an_attempt() {
        let q = MemoryJobQueue::default();
        let id = q.enqueue(&key("e1", 10), false).unwrap();
        q.lease().unwrap().unwrap();

        assert_eq!(q.reclaim_stale(Duration::hours(1)).unwrap(), 0);
        assert_eq!(q.reclaim_stale(Duration::zero()).unwrap(), 1);
        assert_eq!(q.state(&id).unwrap(), Some(JobState::Pending));
        assert_eq!(q.lease().unwrap().unwrap().attempts, 1);
    }
}
