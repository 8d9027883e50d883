//! Synthetic spike rasters with population bursts.
//!
//! Used by `hmmc demo` and by tests that need a realistic raster without data
//! on disk. Generation is fully deterministic: the seed is derived from the
//! config and the `(source, experiment)` pair, so every bin size and surrogate
//! of one experiment is built from the same underlying spike train.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Poisson;

use crate::data::provider::{RasterProvider, with_surrogate};
use crate::data::raster::{Raster, RasterRequest};
use crate::error::{AppError, DataError};

/// Sub-bin resolution spikes are generated at, in ms.
const GEN_STEP_MS: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    pub experiments: Vec<String>,
    pub n_units: usize,
    pub duration_ms: f64,
    /// Background rate per unit.
    pub base_rate_hz: f64,
    /// Expected number of bursts per second.
    pub burst_rate_hz: f64,
    /// Rate multiplier during a burst.
    pub burst_gain: f64,
    pub burst_len_ms: f64,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            experiments: vec!["e1".to_string(), "e2".to_string()],
            n_units: 12,
            duration_ms: 30_000.0,
            base_rate_hz: 2.0,
            burst_rate_hz: 0.5,
            burst_gain: 25.0,
            burst_len_ms: 60.0,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticRasterProvider {
    config: SyntheticConfig,
}

impl SyntheticRasterProvider {
    pub fn new(config: SyntheticConfig) -> Result<Self, AppError> {
        if config.n_units == 0 {
            return Err(AppError::new(2, "Synthetic raster needs at least one unit."));
        }
        if config.experiments.is_empty() {
            return Err(AppError::new(2, "Synthetic raster needs at least one experiment name."));
        }
        if !(config.duration_ms.is_finite() && config.duration_ms >= GEN_STEP_MS) {
            return Err(AppError::new(2, "Invalid synthetic duration."));
        }
        if !(config.base_rate_hz.is_finite() && config.base_rate_hz > 0.0) {
            return Err(AppError::new(2, "Base firing rate must be > 0."));
        }
        if !(config.burst_rate_hz.is_finite()
            && config.burst_rate_hz >= 0.0
            && config.burst_gain.is_finite()
            && config.burst_gain >= 1.0
            && config.burst_len_ms.is_finite()
            && config.burst_len_ms > 0.0)
        {
            return Err(AppError::new(2, "Invalid burst settings."));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    /// Spike times `(unit, time_ms)` for one experiment.
    pub fn spikes(&self, source: &str, experiment: &str) -> Result<Vec<(usize, f64)>, DataError> {
        let cfg = &self.config;
        let mut rng = StdRng::seed_from_u64(sample_seed(cfg, source, experiment));
        let n_steps = (cfg.duration_ms / GEN_STEP_MS).floor() as usize;

        // Burst onsets: Bernoulli per step with p = burst_rate * step.
        let p_onset = (cfg.burst_rate_hz * GEN_STEP_MS / 1000.0).clamp(0.0, 1.0);
        let burst_steps = (cfg.burst_len_ms / GEN_STEP_MS).ceil() as usize;
        let mut in_burst = vec![false; n_steps];
        let mut step = 0;
        while step < n_steps {
            if rng.gen_bool(p_onset) {
                let end = (step + burst_steps).min(n_steps);
                in_burst[step..end].fill(true);
                step = end;
            } else {
                step += 1;
            }
        }

        let base_lambda = cfg.base_rate_hz * GEN_STEP_MS / 1000.0;
        let quiet = Poisson::new(base_lambda).map_err(|e| DataError::Parse {
            path: source.into(),
            message: format!("rate distribution error: {e}"),
        })?;
        let bursting = Poisson::new(base_lambda * cfg.burst_gain).map_err(|e| DataError::Parse {
            path: source.into(),
            message: format!("rate distribution error: {e}"),
        })?;

        let mut spikes = Vec::new();
        for (s, &burst) in in_burst.iter().enumerate() {
            let dist = if burst { &bursting } else { &quiet };
            for unit in 0..cfg.n_units {
                let n: f64 = dist.sample(&mut rng);
                for _ in 0..n as usize {
                    let jitter: f64 = rng.r#gen();
                    spikes.push((unit, (s as f64 + jitter) * GEN_STEP_MS));
                }
            }
        }
        Ok(spikes)
    }
}

impl RasterProvider for SyntheticRasterProvider {
    fn load(&self, request: &RasterRequest) -> Result<Raster, DataError> {
        if !self.config.experiments.iter().any(|e| e == &request.experiment) {
            return Err(DataError::NotFound {
                source_name: request.source.clone(),
                experiment: request.experiment.clone(),
                path: format!("synthetic:{}/{}", request.source, request.experiment).into(),
            });
        }
        let spikes = self.spikes(&request.source, &request.experiment)?;
        let real = Raster::from_spikes(request.clone(), self.config.n_units, &spikes, self.config.duration_ms);
        with_surrogate(real, request)
    }

    fn experiments(&self, _source: &str) -> Result<Vec<String>, DataError> {
        let mut names = self.config.experiments.clone();
        names.sort();
        Ok(names)
    }
}

fn sample_seed(config: &SyntheticConfig, source: &str, experiment: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    config.seed.hash(&mut hasher);
    config.n_units.hash(&mut hasher);
    config.duration_ms.to_bits().hash(&mut hasher);
    config.base_rate_hz.to_bits().hash(&mut hasher);
    config.burst_rate_hz.to_bits().hash(&mut hasher);
    config.burst_gain.to_bits().hash(&mut hasher);
    config.burst_len_ms.to_bits().hash(&mut hasher);
    source.hash(&mut hasher);
    experiment.hash(&mut hasher);
    hasher.finish()
}
