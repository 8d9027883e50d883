//! Shared fixtures for unit tests.

use chrono::Utc;
use nalgebra::{DMatrix, DVector};

use crate::domain::{FittedModel, Library, ModelKey, Surrogate};
use crate::models::PoissonHmm;

pub fn key(experiment: &str, n_states: u32) -> ModelKey {
    ModelKey::new("A", experiment, 30, n_states, Surrogate::Real, Library::Default).unwrap()
}

/// A small valid model tagged with `key` and `attempt`.
pub fn model(key: &ModelKey, attempt: u32) -> FittedModel {
    let hmm = PoissonHmm::new(
        DVector::from_vec(vec![0.5, 0.5]),
        DMatrix::from_row_slice(2, 2, &[0.9, 0.1, 0.2, 0.8]),
        DMatrix::from_row_slice(2, 2, &[0.1, 0.1, 5.0, 5.0]),
    )
    .unwrap();
    FittedModel {
        key: key.clone(),
        hmm,
        log_likelihood: -123.5,
        iterations: 10,
        converged: true,
        attempt,
        fitted_at: Utc::now(),
    }
}
