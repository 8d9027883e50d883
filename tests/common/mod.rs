#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use nalgebra::{DMatrix, DVector};

use hmm_cache::data::{Raster, RasterProvider, RasterRequest};
use hmm_cache::domain::{FittedModel, Library, ModelKey, Surrogate};
use hmm_cache::error::{DataError, FitError};
use hmm_cache::fit::{FitContext, Fitter};
use hmm_cache::models::PoissonHmm;

pub fn key(experiment: &str, n_states: u32) -> ModelKey {
    ModelKey::new("A", experiment, 30, n_states, Surrogate::Real, Library::Default).unwrap()
}

pub fn model(key: &ModelKey, attempt: u32) -> FittedModel {
    let hmm = PoissonHmm::new(
        DVector::from_vec(vec![0.5, 0.5]),
        DMatrix::from_row_slice(2, 2, &[0.9, 0.1, 0.1, 0.9]),
        DMatrix::from_row_slice(2, 1, &[0.2, 4.0]),
    )
    .unwrap();
    FittedModel {
        key: key.clone(),
        hmm,
        log_likelihood: -10.0,
        iterations: 5,
        converged: true,
        attempt,
        fitted_at: Utc::now(),
    }
}

/// Serves a small constant raster for any request.
pub struct ConstProvider;

impl RasterProvider for ConstProvider {
    fn load(&self, request: &RasterRequest) -> Result<Raster, DataError> {
        Ok(Raster::from_counts(request.clone(), DMatrix::from_element(50, 1, 1.0)))
    }

    fn experiments(&self, _source: &str) -> Result<Vec<String>, DataError> {
        Ok(vec!["e1".into()])
    }
}

/// What a scripted fitter does on a given attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Succeed,
    Numerical,
    Invalid,
}

/// Fitter driven by a per-attempt script that records every call and checks
/// that no key is fitted by two threads at once.
pub struct ScriptedFitter {
    script: fn(u32) -> Step,
    delay: Duration,
    active: Mutex<HashSet<ModelKey>>,
    pub calls: AtomicUsize,
    pub overlaps: AtomicUsize,
    pub attempts: Mutex<Vec<u32>>,
}

impl ScriptedFitter {
    pub fn new(script: fn(u32) -> Step) -> Self {
        Self {
            script,
            delay: Duration::ZERO,
            active: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fitter for ScriptedFitter {
    fn fit(&self, key: &ModelKey, _raster: &Raster, ctx: FitContext) -> Result<FittedModel, FitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.attempts.lock().unwrap().push(ctx.attempt);
        if !self.active.lock().unwrap().insert(key.clone()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        std::thread::sleep(self.delay);
        self.active.lock().unwrap().remove(key);

        match (self.script)(ctx.attempt) {
            Step::Succeed => Ok(model(key, ctx.attempt)),
            Step::Numerical => Err(FitError::Numerical("zero division in normalization".into())),
            Step::Invalid => Err(FitError::InvalidInput("raster has no spikes".into())),
        }
    }
}
