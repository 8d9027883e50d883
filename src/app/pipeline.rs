//! Sweep workflow shared by `hmmc sweep` and `hmmc enqueue`.
//!
//! experiment selection -> model keys -> rasters -> models (cache / compute /
//! queue) -> entropy profiles -> per-experiment summaries
//!
//! The CLI layer only builds a [`SweepConfig`] and prints the result.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::data::{RasterProvider, RasterRequest, load_unit_order, select_experiments};
use crate::domain::{JobId, Library, ModelKey, Surrogate};
use crate::error::AppError;
use crate::handle::ModelHandle;
use crate::io::ProfileRow;
use crate::models::{EntropyOptions, EntropyProfile};
use crate::queue::JobQueue;
use crate::report::{ExperimentSummary, StateEntropy};

/// The parameter grid of a sweep: one key per (experiment, state count).
#[derive(Debug, Clone, PartialEq)]
pub struct KeyGrid {
    pub source: String,
    /// Experiment name glob.
    pub experiments: String,
    pub bin_size_ms: u32,
    pub states: Vec<u32>,
    pub surrogate: Surrogate,
    pub library: Library,
}

/// How models missing from the cache are obtained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acquire {
    CachedOnly,
    /// Fit locally on a pool of `jobs` threads.
    Compute { jobs: usize },
    /// Enqueue for workers, then poll the cache for up to `wait`.
    Queue { wait: Duration, poll: Duration },
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub grid: KeyGrid,
    pub acquire: Acquire,
    pub entropy: EntropyOptions,
    pub metrics_dir: PathBuf,
    pub verbose: bool,
}

/// One computed profile, kept for export.
#[derive(Debug, Clone)]
pub struct ProfileRecord {
    pub experiment: String,
    pub n_states: u32,
    pub bin_size_ms: u32,
    pub profile: EntropyProfile,
}

impl ProfileRecord {
    pub fn as_row(&self) -> ProfileRow<'_> {
        ProfileRow {
            experiment: &self.experiment,
            n_states: self.n_states,
            bin_size_ms: self.bin_size_ms,
            profile: &self.profile,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepOutput {
    pub summaries: Vec<ExperimentSummary>,
    pub profiles: Vec<ProfileRecord>,
    pub enqueued: Vec<JobId>,
}

/// Expand the grid into model keys, experiment-major.
pub fn sweep_keys(provider: &dyn RasterProvider, grid: &KeyGrid) -> Result<Vec<ModelKey>, AppError> {
    if grid.states.is_empty() {
        return Err(AppError::new(2, "Empty state range."));
    }
    let experiments = select_experiments(provider, &grid.source, &grid.experiments)?;
    if experiments.is_empty() {
        return Err(AppError::new(
            3,
            format!("No experiments of source '{}' match '{}'.", grid.source, grid.experiments),
        ));
    }

    let mut keys = Vec::with_capacity(experiments.len() * grid.states.len());
    for exp in &experiments {
        for &n in &grid.states {
            keys.push(ModelKey::new(
                grid.source.clone(),
                exp.clone(),
                grid.bin_size_ms,
                n,
                grid.surrogate.clone(),
                grid.library,
            )?);
        }
    }
    Ok(keys)
}

/// Enqueue every uncached key of the grid.
pub fn enqueue_sweep(
    provider: &dyn RasterProvider,
    handle: &ModelHandle,
    queue: &dyn JobQueue,
    grid: &KeyGrid,
    verbose: bool,
) -> Result<(Vec<ModelKey>, Vec<JobId>), AppError> {
    let keys = sweep_keys(provider, grid)?;
    let ids = handle.enqueue_missing(&keys, queue, verbose)?;
    tracing::info!(keys = keys.len(), enqueued = ids.len(), "sweep enqueued");
    Ok((keys, ids))
}

/// Run a full sweep.
///
/// Experiments whose raster cannot be loaded are skipped with a warning; the
/// sweep fails only if none can be loaded.
pub fn run_sweep(
    config: &SweepConfig,
    provider: &dyn RasterProvider,
    handle: &ModelHandle,
    queue: Option<&dyn JobQueue>,
) -> Result<SweepOutput, AppError> {
    let keys = sweep_keys(provider, &config.grid)?;

    let mut rasters = HashMap::new();
    let mut experiments: Vec<RasterRequest> = Vec::new();
    for key in &keys {
        let request = RasterRequest::for_key(key);
        if experiments.contains(&request) {
            continue;
        }
        match provider.load(&request) {
            Ok(raster) => {
                rasters.insert(request.clone(), raster);
            }
            Err(e) => tracing::warn!(experiment = %request.experiment, error = %e, "skipping experiment"),
        }
        experiments.push(request);
    }
    if rasters.is_empty() {
        return Err(AppError::new(3, "No experiment raster could be loaded."));
    }
    let keys: Vec<ModelKey> = keys
        .into_iter()
        .filter(|k| rasters.contains_key(&RasterRequest::for_key(k)))
        .collect();

    let mut enqueued = Vec::new();
    let resolved = match config.acquire {
        Acquire::CachedOnly => handle.compute_many(&keys, &rasters, 1, false),
        Acquire::Compute { jobs } => handle.compute_many(&keys, &rasters, jobs, true),
        Acquire::Queue { wait, poll } => {
            let queue = queue.ok_or_else(|| AppError::new(2, "Queue mode needs a job queue."))?;
            enqueued = handle.enqueue_missing(&keys, queue, config.verbose)?;
            tracing::info!(enqueued = enqueued.len(), "missing models enqueued");
            if !wait.is_zero() {
                handle.wait_for(&keys, poll, wait);
            }
            handle.compute_many(&keys, &rasters, 1, false)
        }
    };

    let mut by_experiment: HashMap<RasterRequest, ExperimentSummary> = HashMap::new();
    let mut profiles = Vec::new();
    for (key, model) in resolved {
        let request = RasterRequest::for_key(&key);
        let Some(raster) = rasters.get(&request) else {
            continue;
        };
        let summary = by_experiment.entry(request).or_insert_with(|| {
            let order = load_unit_order(&config.metrics_dir, raster.experiment(), raster.n_units());
            ExperimentSummary::new(raster, &config.entropy.bursts, &order)
        });

        match model {
            Some(model) => {
                let profile = handle.entropy(&model, raster, &config.entropy);
                summary.push_model(StateEntropy::from_profile(key.n_states(), &profile));
                profiles.push(ProfileRecord {
                    experiment: key.experiment().to_string(),
                    n_states: key.n_states(),
                    bin_size_ms: key.bin_size_ms(),
                    profile,
                });
            }
            None => summary.push_missing(key.n_states()),
        }
    }

    let summaries = experiments
        .iter()
        .filter_map(|request| by_experiment.remove(request))
        .collect();
    Ok(SweepOutput {
        summaries,
        profiles,
        enqueued,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cache::MemoryModelCache;
    use crate::data::{SyntheticConfig, SyntheticRasterProvider};
    use crate::domain::RetryPolicy;
    use crate::fit::{FitOptions, HmmFitter};
    use crate::queue::MemoryJobQueue;

    fn provider() -> SyntheticRasterProvider {
        SyntheticRasterProvider::new(SyntheticConfig {
            experiments: vec!["e1".into(), "e2".into(), "x1".into()],
            n_units: 4,
            duration_ms: 6_000.0,
            ..SyntheticConfig::default()
        })
        .unwrap()
    }

    fn handle() -> ModelHandle {
        let fitter = HmmFitter::new(FitOptions {
            max_iter: 20,
            seed: Some(3),
            ..FitOptions::default()
        });
        ModelHandle::new(Arc::new(MemoryModelCache::new()), Arc::new(fitter), RetryPolicy::new(3))
    }

    fn config(acquire: Acquire) -> SweepConfig {
        SweepConfig {
            grid: KeyGrid {
                source: "A".into(),
                experiments: "e*".into(),
                bin_size_ms: 30,
                states: vec![2, 3],
                surrogate: Surrogate::Real,
                library: Library::Default,
            },
            acquire,
            entropy: EntropyOptions::default(),
            metrics_dir: PathBuf::from("/nonexistent-metrics"),
            verbose: false,
        }
    }

    #[test]
    fn keys_cover_matching_experiments_and_states() {
        let keys = sweep_keys(&provider(), &config(Acquire::CachedOnly).grid).unwrap();
        let names: Vec<(String, u32)> = keys.iter().map(|k| (k.experiment().to_string(), k.n_states())).collect();
        assert_eq!(
            names,
            vec![("e1".into(), 2), ("e1".into(), 3), ("e2".into(), 2), ("e2".into(), 3)]
        );
    }

    #[test]
    fn unmatched_glob_is_an_error() {
        let mut grid = config(Acquire::CachedOnly).grid;
        grid.experiments = "zz*".into();
        let err = sweep_keys(&provider(), &grid).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn cached_only_reports_every_model_missing() {
        let out = run_sweep(&config(Acquire::CachedOnly), &provider(), &handle(), None).unwrap();
        assert_eq!(out.summaries.len(), 2);
        assert!(out.profiles.is_empty());
        for s in &out.summaries {
            assert_eq!(s.missing, vec![2, 3]);
            assert_eq!(s.n_units, 4);
            assert_eq!(s.top_units, vec![1, 2, 3, 4]);
        }
    }

    #[test]
    fn compute_mode_fills_the_cache() {
        let h = handle();
        let out = run_sweep(&config(Acquire::Compute { jobs: 2 }), &provider(), &h, None).unwrap();
        assert_eq!(out.profiles.len(), 4);
        assert!(out.summaries.iter().all(|s| s.missing.is_empty() && s.models.len() == 2));
        assert_eq!(h.cache().keys().unwrap().len(), 4);

        // A second cached-only pass sees the same models.
        let again = run_sweep(&config(Acquire::CachedOnly), &provider(), &h, None).unwrap();
        assert_eq!(again.profiles.len(), 4);
    }

    #[test]
    fn queue_mode_enqueues_missing_keys_only() {
        let h = handle();
        let queue = MemoryJobQueue::default();
        let p = provider();
        let cfg = config(Acquire::Queue {
            wait: Duration::ZERO,
            poll: Duration::from_millis(1),
        });
        let (keys, _) = enqueue_sweep(&p, &h, &queue, &cfg.grid, false).unwrap();
        assert_eq!(keys.len(), 4);

        // Pending jobs do not count as cached, so the sweep enqueues them again.
        let out = run_sweep(&cfg, &p, &h, Some(&queue)).unwrap();
        assert_eq!(out.enqueued.len(), 4);
        assert_eq!(queue.snapshot().unwrap().pending.len(), 8);
        assert!(out.summaries.iter().all(|s| s.missing.len() == 2));

        assert!(run_sweep(&cfg, &p, &h, None).is_err());
    }
}
