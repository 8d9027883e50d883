//! Filesystem job queue shared by independent worker processes.
//!
//! Layout:
//!
//! ```text
//! <root>/
//!   .tmp/          in-flight writes
//!   pending/<id>.json
//!   leased/<id>.json
//!   abandoned/<id>.json
//!   keys/<source>/<key>.lock   id of the job holding the key's lease
//! ```
//!
//! State transitions are `rename`s between directories. A lease is
//! `rename(pending/<id>, leased/<id>)`: when several processes race for the
//! same file exactly one rename succeeds and the others see `NotFound` and move
//! on to the next candidate. Every later move first claims the file by
//! renaming it into `.tmp/`, then publishes the updated job into its new
//! directory without clobbering.
//!
//! Duplicate jobs for one key may sit in `pending/`, but only one of them is
//! leased at a time: a lease first creates the key's lock file with
//! `create_new`, and every move out of `leased/` removes it.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};

use crate::domain::{Job, JobId, JobState, ModelKey, RequeueOutcome, RetryPolicy};
use crate::error::QueueError;
use crate::io::json::{JsonFileError, Publish, read_json, unique_tmp_name, write_json_atomic};
use crate::queue::{JobQueue, QueueSnapshot, is_stale, mark_leased, record_failure, unlease};

const TMP_DIR: &str = ".tmp";
const KEYS_DIR: &str = "keys";

#[derive(Debug, Clone)]
pub struct FsJobQueue {
    root: PathBuf,
    policy: RetryPolicy,
}

impl FsJobQueue {
    /// Open (creating if needed) a queue rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, policy: RetryPolicy) -> Result<Self, QueueError> {
        let root = root.into();
        for state in [JobState::Pending, JobState::Leased, JobState::Abandoned] {
            let dir = root.join(state.to_string());
            fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        }
        for extra in [TMP_DIR, KEYS_DIR] {
            let dir = root.join(extra);
            fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        }
        Ok(Self { root, policy })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, state: JobState) -> PathBuf {
        self.root.join(state.to_string())
    }

    fn job_path(&self, state: JobState, id: &JobId) -> PathBuf {
        self.dir(state).join(format!("{id}.json"))
    }

    fn key_lock_path(&self, key: &ModelKey) -> PathBuf {
        self.root.join(KEYS_DIR).join(key.storage_path().with_extension("lock"))
    }

    /// Take the lease lock of `key` for job `id`. `Ok(false)` when another job holds it.
    fn lock_key(&self, key: &ModelKey, id: &JobId) -> Result<bool, QueueError> {
        let path = self.key_lock_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(id.as_str().as_bytes()).map_err(|e| io_error(&path, e))?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    /// Drop the lease lock of `key` if job `id` holds it.
    fn release_key(&self, key: &ModelKey, id: &JobId) -> Result<(), QueueError> {
        let path = self.key_lock_path(key);
        match fs::read_to_string(&path) {
            Ok(holder) if holder == id.as_str() => {}
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error(&path, e)),
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    /// Remove key locks older than `cutoff` whose holder is not leased.
    ///
    /// These are left behind by a process that died between taking the lock
    /// and claiming the job.
    fn clear_orphan_locks(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueError> {
        let leased: HashSet<String> = self
            .list_ids(JobState::Leased)?
            .into_iter()
            .map(|id| id.as_str().to_string())
            .collect();

        let mut cleared = 0;
        for source in subdirs(&self.root.join(KEYS_DIR))? {
            let entries = fs::read_dir(&source).map_err(|e| io_error(&source, e))?;
            for entry in entries {
                let path = entry.map_err(|e| io_error(&source, e))?.path();
                let holder = match fs::read_to_string(&path) {
                    Ok(holder) => holder,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(io_error(&path, e)),
                };
                if leased.contains(&holder) {
                    continue;
                }
                if modified_at(&path)?.is_none_or(|at| at > cutoff) {
                    continue;
                }
                match fs::remove_file(&path) {
                    Ok(()) => {
                        tracing::warn!(lock = %path.display(), holder = %holder, "cleared orphaned key lock");
                        cleared += 1;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_error(&path, e)),
                }
            }
        }
        Ok(cleared)
    }

    fn write_job(&self, path: &Path, job: &Job, mode: Publish) -> Result<(), QueueError> {
        write_json_atomic(&self.root.join(TMP_DIR), path, job, false, mode).map_err(|e| json_error(path, e))
    }

    fn read_job(&self, path: &Path) -> Result<Option<Job>, QueueError> {
        read_json::<Job>(path).map_err(|e| json_error(path, e))
    }

    /// Job ids in `state`, sorted (roughly FIFO).
    fn list_ids(&self, state: JobState) -> Result<Vec<JobId>, QueueError> {
        let dir = self.dir(state);
        let entries = fs::read_dir(&dir).map_err(|e| io_error(&dir, e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&dir, e))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(JobId::from_file_stem)
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn list_jobs(&self, state: JobState) -> Result<Vec<Job>, QueueError> {
        let mut jobs = Vec::new();
        for id in self.list_ids(state)? {
            let path = self.job_path(state, &id);
            match self.read_job(&path) {
                Ok(Some(job)) => jobs.push(job),
                // Moved by another process since listing.
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable job file"),
            }
        }
        Ok(jobs)
    }

    /// Charge the attempt of a job just renamed into `leased/`.
    ///
    /// The file is claimed into `.tmp/` and republished without clobbering, so
    /// if a reclaim moved it first the lease is dropped instead of recreated.
    fn stamp_lease(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        let path = self.job_path(JobState::Leased, id);
        let claim = self.root.join(TMP_DIR).join(format!("{id}.{}", unique_tmp_name()));
        match fs::rename(&path, &claim) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        }

        let mut job = match self.read_job(&claim) {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(None),
            Err(e) => {
                let _ = fs::rename(&claim, &path);
                return Err(e);
            }
        };
        mark_leased(&mut job, Utc::now());
        if let Err(e) = self.write_job(&path, &job, Publish::NoClobber) {
            let _ = fs::rename(&claim, &path);
            return Err(e);
        }
        fs::remove_file(&claim).map_err(|e| io_error(&claim, e))?;
        Ok(Some(job))
    }

    /// When the lease of an unstamped job began: its key lock's mtime, or the
    /// job file's if the lock is gone.
    fn unstamped_since(&self, job: &Job) -> Result<Option<DateTime<Utc>>, QueueError> {
        match modified_at(&self.key_lock_path(&job.key))? {
            Some(at) => Ok(Some(at)),
            None => modified_at(&self.job_path(JobState::Leased, &job.id)),
        }
    }

    /// Move leased job `id` out of `leased/`; `update` edits the job and picks
    /// its new state. The key lock is released afterwards.
    ///
    /// The job file is first claimed by renaming it into `.tmp/`, so a job that
    /// completes or moves concurrently is never resurrected by the rewrite.
    fn transition<R>(
        &self,
        id: &JobId,
        update: impl FnOnce(&mut Job) -> (JobState, R),
    ) -> Result<R, QueueError> {
        let source = self.job_path(JobState::Leased, id);
        let claim = self.root.join(TMP_DIR).join(format!("{id}.{}", unique_tmp_name()));
        match fs::rename(&source, &claim) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(QueueError::UnknownJob(id.clone())),
            Err(e) => return Err(io_error(&source, e)),
        }

        let mut job = match self.read_job(&claim) {
            Ok(Some(job)) => job,
            Ok(None) => return Err(QueueError::UnknownJob(id.clone())),
            Err(e) => {
                // Put it back for inspection.
                let _ = fs::rename(&claim, &source);
                return Err(e);
            }
        };
        let (to, out) = update(&mut job);

        let target = self.job_path(to, id);
        if let Err(e) = self.write_job(&target, &job, Publish::NoClobber) {
            let _ = fs::rename(&claim, &source);
            return Err(e);
        }
        fs::remove_file(&claim).map_err(|e| io_error(&claim, e))?;
        self.release_key(&job.key, id)?;
        Ok(out)
    }
}

impl JobQueue for FsJobQueue {
    fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn enqueue(&self, key: &ModelKey, verbose: bool) -> Result<JobId, QueueError> {
        let job = Job::new(key.clone(), verbose);
        let path = self.job_path(JobState::Pending, &job.id);
        self.write_job(&path, &job, Publish::NoClobber)?;
        Ok(job.id)
    }

    fn lease(&self) -> Result<Option<Job>, QueueError> {
        for id in self.list_ids(JobState::Pending)? {
            let from = self.job_path(JobState::Pending, &id);
            let key = match self.read_job(&from) {
                Ok(Some(job)) => job.key,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(path = %from.display(), error = %e, "skipping unreadable job file");
                    continue;
                }
            };
            if !self.lock_key(&key, &id)? {
                // Another job for this key is being fitted.
                continue;
            }

            let to = self.job_path(JobState::Leased, &id);
            if let Err(e) = fs::rename(&from, &to) {
                self.release_key(&key, &id)?;
                // NotFound: another process won this one.
                if e.kind() == io::ErrorKind::NotFound {
                    continue;
                }
                return Err(io_error(&from, e));
            }

            match self.stamp_lease(&id)? {
                Some(job) => return Ok(Some(job)),
                // Reclaimed before the attempt was charged.
                None => continue,
            }
        }
        Ok(None)
    }

    fn complete(&self, id: &JobId) -> Result<(), QueueError> {
        let path = self.job_path(JobState::Leased, id);
        let job = self.read_job(&path)?.ok_or_else(|| QueueError::UnknownJob(id.clone()))?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(QueueError::UnknownJob(id.clone())),
            Err(e) => return Err(io_error(&path, e)),
        }
        self.release_key(&job.key, id)
    }

    fn requeue(&self, id: &JobId, reason: &str) -> Result<RequeueOutcome, QueueError> {
        let policy = self.policy;
        self.transition(id, |job| {
            let outcome = record_failure(job, reason, policy);
            let to = match outcome {
                RequeueOutcome::Accepted => JobState::Pending,
                RequeueOutcome::Rejected => JobState::Abandoned,
            };
            (to, outcome)
        })
    }

    fn abandon(&self, id: &JobId, reason: &str) -> Result<(), QueueError> {
        self.transition(id, |job| {
            job.last_error = Some(reason.to_string());
            job.leased_at = None;
            (JobState::Abandoned, ())
        })
    }

    fn state(&self, id: &JobId) -> Result<Option<JobState>, QueueError> {
        // Check in lifecycle order so a job moving forward mid-check is still found.
        for state in [JobState::Pending, JobState::Leased, JobState::Abandoned] {
            let path = self.job_path(state, id);
            match fs::metadata(&path) {
                Ok(_) => return Ok(Some(state)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(&path, e)),
            }
        }
        Ok(None)
    }

    fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        Ok(QueueSnapshot {
            pending: self.list_jobs(JobState::Pending)?,
            leased: self.list_jobs(JobState::Leased)?,
            abandoned: self.list_jobs(JobState::Abandoned)?,
        })
    }

    fn reclaim_stale(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now() - older_than;
        let mut reclaimed = 0;
        for job in self.list_jobs(JobState::Leased)? {
            let stale = match job.leased_at {
                Some(_) => is_stale(&job, cutoff),
                // Not stamped yet: the key lock was taken at lease time.
                None => self.unstamped_since(&job)?.is_some_and(|at| at <= cutoff),
            };
            if !stale {
                continue;
            }
            let reclaim = |job: &mut Job| {
                unlease(job);
                (JobState::Pending, ())
            };
            match self.transition(&job.id, reclaim) {
                Ok(()) => {
                    tracing::info!(job = %job.id, key = %job.key, "reclaimed stale lease");
                    reclaimed += 1;
                }
                // Completed or requeued by its worker in the meantime.
                Err(QueueError::UnknownJob(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.clear_orphan_locks(cutoff)?;
        Ok(reclaimed)
    }
}

/// Modification time of `path`; `None` once it is gone.
fn modified_at(path: &Path) -> Result<Option<DateTime<Utc>>, QueueError> {
    match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(at) => Ok(Some(DateTime::<Utc>::from(at))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path, e)),
    }
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>, QueueError> {
    let entries = fs::read_dir(dir).map_err(|e| io_error(dir, e))?;
    let mut out = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| io_error(dir, e))?.path();
        if path.is_dir() {
            out.push(path);
        }
    }
    Ok(out)
}

fn io_error(path: &Path, source: io::Error) -> QueueError {
    QueueError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn json_error(path: &Path, e: JsonFileError) -> QueueError {
    match e {
        JsonFileError::Io(source) => io_error(path, source),
        JsonFileError::Parse(err) => QueueError::Corrupt {
            path: path.to_path_buf(),
            message: err.to_string(),
        },
    }
}
