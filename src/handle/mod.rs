//! Consumer-side access to fitted models.
//!
//! Analysis code never talks to the fitter directly. It asks a [`ModelHandle`]
//! for a key and chooses the access mode:
//!
//! - [`ModelHandle::get_or_none`]: cache only, never computes
//! - [`ModelHandle::get_or_compute`]: fit locally on a miss (bounded retries)
//! - [`ModelHandle::enqueue_missing`] + [`ModelHandle::wait_for`]: hand misses to
//!   worker processes and poll the cache
//!
//! Derived statistics (entropy profiles) are memoized here, keyed by model and
//! raster; they are never written back into cached artifacts.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rayon::prelude::*;

use crate::cache::ModelCache;
use crate::data::{Raster, RasterRequest};
use crate::domain::{FittedModel, JobId, ModelKey, RetryPolicy};
use crate::error::{ComputeError, QueueError, StoreError};
use crate::fit::{Fitter, fit_with_retry};
use crate::models::{EntropyOptions, EntropyProfile, compute_entropy};
use crate::queue::JobQueue;

/// Default size of the local fan-out pool.
pub const DEFAULT_JOBS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    key: ModelKey,
    /// Tells an overwritten artifact apart from the one it replaced.
    fitted_at: DateTime<Utc>,
    attempt: u32,
    raster_id: u64,
    options: u64,
}

pub struct ModelHandle {
    cache: Arc<dyn ModelCache>,
    fitter: Arc<dyn Fitter>,
    policy: RetryPolicy,
    verbose: bool,
    entropy_memo: RwLock<HashMap<MemoKey, EntropyProfile>>,
}

impl ModelHandle {
    pub fn new(cache: Arc<dyn ModelCache>, fitter: Arc<dyn Fitter>, policy: RetryPolicy) -> Self {
        Self {
            cache,
            fitter,
            policy,
            verbose: false,
            entropy_memo: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn cache(&self) -> &dyn ModelCache {
        self.cache.as_ref()
    }

    /// The cached model, or `None`. Cache errors are logged and treated as absent.
    pub fn get_or_none(&self, key: &ModelKey) -> Option<FittedModel> {
        match self.cache.lookup(key) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "model unavailable");
                None
            }
        }
    }

    /// The cached model, fitting and storing it first if missing.
    ///
    /// If another process stores the same key while this one is fitting, the
    /// already-cached artifact wins and is returned.
    pub fn get_or_compute(&self, key: &ModelKey, raster: &Raster) -> Result<FittedModel, ComputeError> {
        if let Some(model) = self.cache.lookup(key)? {
            return Ok(model);
        }

        tracing::info!(key = %key, "fitting missing model");
        let model = fit_with_retry(self.fitter.as_ref(), key, raster, self.policy, self.verbose)?;
        match self.cache.store(key, &model, false) {
            Ok(()) => Ok(model),
            Err(StoreError::AlreadyExists(_)) => {
                tracing::info!(key = %key, "model cached concurrently, using stored artifact");
                Ok(self.cache.lookup(key)?.unwrap_or(model))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve many keys on a bounded thread pool.
    ///
    /// Each distinct key is looked up, and fitted when `allow_compute` is set
    /// and its raster is in `rasters`. Failures are logged and come back as
    /// `None`; results follow the first-seen order of `keys`.
    pub fn compute_many(
        &self,
        keys: &[ModelKey],
        rasters: &HashMap<RasterRequest, Raster>,
        jobs: usize,
        allow_compute: bool,
    ) -> Vec<(ModelKey, Option<FittedModel>)> {
        let distinct = dedup(keys);
        let resolve = |key: &ModelKey| -> Option<FittedModel> {
            if !allow_compute {
                return self.get_or_none(key);
            }
            let Some(raster) = rasters.get(&RasterRequest::for_key(key)) else {
                tracing::warn!(key = %key, "no raster loaded for key");
                return self.get_or_none(key);
            };
            match self.get_or_compute(key, raster) {
                Ok(model) => Some(model),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "model unavailable");
                    None
                }
            }
        };

        match rayon::ThreadPoolBuilder::new().num_threads(jobs.max(1)).build() {
            Ok(pool) => pool.install(|| {
                distinct
                    .par_iter()
                    .map(|key| (key.clone(), resolve(key)))
                    .collect()
            }),
            Err(e) => {
                tracing::warn!(error = %e, "thread pool unavailable, resolving sequentially");
                distinct.iter().map(|key| (key.clone(), resolve(key))).collect()
            }
        }
    }

    /// Enqueue a job for every distinct key that is not cached yet.
    pub fn enqueue_missing(
        &self,
        keys: &[ModelKey],
        queue: &dyn JobQueue,
        verbose: bool,
    ) -> Result<Vec<JobId>, QueueError> {
        let mut ids = Vec::new();
        for key in dedup(keys) {
            let cached = self.cache.exists(&key).unwrap_or_else(|e| {
                tracing::warn!(key = %key, error = %e, "cache check failed, enqueueing anyway");
                false
            });
            if cached {
                continue;
            }
            let id = queue.enqueue(&key, verbose)?;
            tracing::debug!(key = %key, job = %id, "enqueued");
            ids.push(id);
        }
        Ok(ids)
    }

    /// Poll until every key is cached or `timeout` elapses. Returns the keys
    /// still missing (empty on success); each is logged at WARN.
    pub fn wait_for(&self, keys: &[ModelKey], poll: Duration, timeout: Duration) -> Vec<ModelKey> {
        let deadline = Instant::now() + timeout;
        let mut missing = dedup(keys);
        loop {
            missing.retain(|key| !matches!(self.cache.exists(key), Ok(true)));
            if missing.is_empty() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(poll.min(deadline.saturating_duration_since(Instant::now())));
        }
        for key in &missing {
            tracing::warn!(key = %key, "model still missing, giving up");
        }
        missing
    }

    /// Burst-aligned entropy profile of `model` on `raster`, memoized.
    pub fn entropy(&self, model: &FittedModel, raster: &Raster, opts: &EntropyOptions) -> EntropyProfile {
        let memo_key = MemoKey {
            key: model.key.clone(),
            fitted_at: model.fitted_at,
            attempt: model.attempt,
            raster_id: raster.id(),
            options: options_fingerprint(opts),
        };
        if let Some(hit) = self
            .entropy_memo
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&memo_key)
        {
            return hit.clone();
        }

        let profile = compute_entropy(&model.hmm, raster, opts);
        self.entropy_memo
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(memo_key, profile.clone());
        profile
    }

    /// Number of memoized entropy profiles.
    pub fn memoized(&self) -> usize {
        self.entropy_memo.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn dedup(keys: &[ModelKey]) -> Vec<ModelKey> {
    let mut seen = HashSet::new();
    keys.iter().filter(|k| seen.insert(*k)).cloned().collect()
}

fn options_fingerprint(opts: &EntropyOptions) -> u64 {
    let mut hasher = DefaultHasher::new();
    opts.bursts.rms_factor.to_bits().hash(&mut hasher);
    opts.bursts.margins.hash(&mut hasher);
    opts.baseline_windows.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nalgebra::{DMatrix, DVector};

    use crate::cache::MemoryModelCache;
    use crate::data::BurstOptions;
    use crate::models::PoissonHmm;
    use crate::error::FitError;
    use crate::fit::FitContext;
    use crate::queue::MemoryJobQueue;
    use crate::testutil::{key, model};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail_first: Mutex<usize>,
    }

    impl Fitter for Counting {
        fn fit(&self, key: &ModelKey, _raster: &Raster, ctx: FitContext) -> Result<FittedModel, FitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut remaining = self.fail_first.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FitError::Numerical("zero division".into()));
            }
            Ok(model(key, ctx.attempt))
        }
    }

    fn raster_for(k: &ModelKey) -> Raster {
        Raster::from_counts(RasterRequest::for_key(k), DMatrix::from_fn(200, 2, |t, _| ((t / 10) % 2 * 5) as f64))
    }

    fn handle(fitter: Arc<Counting>) -> ModelHandle {
        ModelHandle::new(Arc::new(MemoryModelCache::new()), fitter, RetryPolicy::new(3))
    }

    #[test]
    fn get_or_none_never_computes() {
        let fitter = Arc::new(Counting::default());
        let h = handle(fitter.clone());
        assert!(h.get_or_none(&key("e1", 15)).is_none());
        assert_eq!(fitter.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn get_or_compute_fits_once_and_caches() {
        let fitter = Arc::new(Counting::default());
        *fitter.fail_first.lock().unwrap() = 1;
        let h = handle(fitter.clone());
        let k = key("e1", 15);
        let raster = raster_for(&k);

        let first = h.get_or_compute(&k, &raster).unwrap();
        assert_eq!(first.attempt, 2);
        let second = h.get_or_compute(&k, &raster).unwrap();
        assert_eq!(second, first);
        assert_eq!(fitter.calls.load(Ordering::SeqCst), 2);
        assert!(h.get_or_none(&k).is_some());
    }

    #[test]
    fn compute_many_resolves_distinct_keys() {
        let fitter = Arc::new(Counting::default());
        let h = handle(fitter.clone());
        let keys: Vec<ModelKey> = (10..14).map(|n| key("e1", n)).chain([key("e1", 10)]).collect();
        let mut rasters = HashMap::new();
        rasters.insert(RasterRequest::for_key(&keys[0]), raster_for(&keys[0]));

        let lookups = h.compute_many(&keys, &rasters, 2, false);
        assert_eq!(lookups.len(), 4);
        assert!(lookups.iter().all(|(_, m)| m.is_none()));

        let computed = h.compute_many(&keys, &rasters, 2, true);
        assert_eq!(computed[0].0, key("e1", 10));
        assert!(computed.iter().all(|(_, m)| m.is_some()));
        assert_eq!(fitter.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn enqueue_missing_skips_cached_keys() {
        let h = handle(Arc::new(Counting::default()));
        let cached = key("e1", 10);
        h.cache().store(&cached, &model(&cached, 1), false).unwrap();

        let queue = MemoryJobQueue::default();
        let ids = h
            .enqueue_missing(&[cached.clone(), key("e1", 11), key("e1", 11)], &queue, false)
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(queue.snapshot().unwrap().pending[0].key, key("e1", 11));
    }

    #[test]
    fn wait_for_reports_missing_keys_after_timeout() {
        let h = handle(Arc::new(Counting::default()));
        let present = key("e1", 10);
        h.cache().store(&present, &model(&present, 1), false).unwrap();

        let missing = h.wait_for(
            &[present.clone(), key("e1", 11)],
            Duration::from_millis(5),
            Duration::from_millis(20),
        );
        assert_eq!(missing, vec![key("e1", 11)]);
        assert!(h.wait_for(&[present], Duration::from_millis(5), Duration::ZERO).is_empty());
    }

    #[test]
    fn entropy_is_memoized_per_raster() {
        let h = handle(Arc::new(Counting::default()));
        let k = key("e1", 2);
        let m = model(&k, 1);
        let raster = raster_for(&k);
        let opts = EntropyOptions::default();

        let a = h.entropy(&m, &raster, &opts);
        let b = h.entropy(&m, &raster, &opts);
        assert_eq!(a, b);
        assert_eq!(h.memoized(), 1);

        let other = Raster::from_counts(raster.request().clone(), DMatrix::from_element(200, 2, 1.0));
        h.entropy(&m, &other, &opts);
        assert_eq!(h.memoized(), 2);
    }

    #[test]
    fn overwritten_model_gets_a_fresh_profile() {
        let h = handle(Arc::new(Counting::default()));
        let k = key("e1", 2);
        let raster = raster_for(&k);
        // Every 5-spike block is a burst.
        let opts = EntropyOptions {
            bursts: BurstOptions {
                rms_factor: 1.0,
                ..BurstOptions::default()
            },
            ..EntropyOptions::default()
        };
        let old = model(&k, 1);
        let before = h.entropy(&old, &raster, &opts);

        // Same key, refit with the state labels swapped.
        let refit = FittedModel {
            hmm: PoissonHmm::new(
                DVector::from_vec(vec![0.5, 0.5]),
                DMatrix::from_row_slice(2, 2, &[0.8, 0.2, 0.1, 0.9]),
                DMatrix::from_row_slice(2, 2, &[5.0, 5.0, 0.1, 0.1]),
            )
            .unwrap(),
            attempt: 2,
            fitted_at: old.fitted_at + chrono::Duration::seconds(1),
            ..old.clone()
        };
        h.cache().store(&k, &refit, true).unwrap();

        let after = h.entropy(&refit, &raster, &opts);
        assert!(after.n_bursts > 0);
        assert_eq!(h.memoized(), 2);
        assert_eq!(after, compute_entropy(&refit.hmm, &raster, &opts));
        assert_ne!(after.state_probs, before.state_probs);
    }
}
