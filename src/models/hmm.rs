//! Poisson-emission hidden Markov model.
//!
//! Each hidden state emits an independent Poisson count per unit per time bin.
//! This module only *evaluates* a model (likelihoods, posteriors, decoding);
//! parameter estimation lives in `fit::fitter`.
//!
//! Shapes used throughout:
//! - `counts`: `T × U` (bins × units)
//! - `log_b`: `T × K` per-bin emission log-likelihoods
//! - `alpha`/`beta`/`gamma`: `T × K`

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::FitError;
use crate::math::{log_sum_exp, poisson_ln_pmf};

/// Tolerance on row sums of stochastic vectors/matrices.
const STOCHASTIC_TOL: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoissonHmm {
    /// Initial state distribution (length `K`).
    initial: DVector<f64>,
    /// Row-stochastic transition matrix `A[i, j] = P(j | i)` (`K × K`).
    transition: DMatrix<f64>,
    /// Expected spike count per bin, `rates[k, u]` (`K × U`).
    rates: DMatrix<f64>,
}

/// Forward/backward pass output.
#[derive(Debug, Clone)]
pub struct Posteriors {
    pub log_alpha: DMatrix<f64>,
    pub log_beta: DMatrix<f64>,
    pub log_b: DMatrix<f64>,
    pub log_likelihood: f64,
}

impl PoissonHmm {
    pub fn new(
        initial: DVector<f64>,
        transition: DMatrix<f64>,
        rates: DMatrix<f64>,
    ) -> Result<Self, FitError> {
        let k = initial.len();
        if k < 2 {
            return Err(FitError::InvalidInput(format!("need at least 2 states, got {k}")));
        }
        if transition.shape() != (k, k) {
            return Err(FitError::InvalidInput(format!(
                "transition matrix is {:?}, expected ({k}, {k})",
                transition.shape()
            )));
        }
        if rates.nrows() != k || rates.ncols() == 0 {
            return Err(FitError::InvalidInput(format!(
                "rate matrix is {:?}, expected ({k}, n_units)",
                rates.shape()
            )));
        }
        if !is_distribution(initial.iter().copied()) {
            return Err(FitError::Numerical("initial distribution does not sum to 1".into()));
        }
        for i in 0..k {
            if !is_distribution(transition.row(i).iter().copied()) {
                return Err(FitError::Numerical(format!("transition row {i} does not sum to 1")));
            }
        }
        if rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err(FitError::Numerical("non-finite or negative emission rate".into()));
        }
        Ok(Self {
            initial,
            transition,
            rates,
        })
    }

    pub fn n_states(&self) -> usize {
        self.initial.len()
    }

    pub fn n_units(&self) -> usize {
        self.rates.ncols()
    }

    pub fn initial(&self) -> &DVector<f64> {
        &self.initial
    }

    pub fn transition(&self) -> &DMatrix<f64> {
        &self.transition
    }

    pub fn rates(&self) -> &DMatrix<f64> {
        &self.rates
    }

    /// Per-bin emission log-likelihoods (`T × K`), evaluated in parallel over bins.
    pub fn log_emissions(&self, counts: &DMatrix<f64>) -> DMatrix<f64> {
        let t_len = counts.nrows();
        let k = self.n_states();
        let u = self.n_units().min(counts.ncols());
        let rates = &self.rates;

        let flat: Vec<f64> = (0..t_len)
            .into_par_iter()
            .flat_map_iter(|t| {
                (0..k).map(move |s| {
                    (0..u)
                        .map(|j| poisson_ln_pmf(counts[(t, j)], rates[(s, j)]))
                        .sum::<f64>()
                })
            })
            .collect();

        DMatrix::from_row_slice(t_len, k, &flat)
    }

    fn log_transition(&self) -> DMatrix<f64> {
        self.transition.map(|p| p.ln())
    }

    /// Log-space forward recursion. Returns `(log_alpha, log_likelihood)`.
    pub fn forward(&self, log_b: &DMatrix<f64>) -> (DMatrix<f64>, f64) {
        let t_len = log_b.nrows();
        let k = self.n_states();
        let log_a = self.log_transition();
        let mut alpha = DMatrix::<f64>::from_element(t_len, k, f64::NEG_INFINITY);
        if t_len == 0 {
            return (alpha, f64::NEG_INFINITY);
        }

        for j in 0..k {
            alpha[(0, j)] = self.initial[j].ln() + log_b[(0, j)];
        }
        let mut scratch = vec![0.0; k];
        for t in 1..t_len {
            for j in 0..k {
                for i in 0..k {
                    scratch[i] = alpha[(t - 1, i)] + log_a[(i, j)];
                }
                alpha[(t, j)] = log_sum_exp(&scratch) + log_b[(t, j)];
            }
        }

        let last: Vec<f64> = alpha.row(t_len - 1).iter().copied().collect();
        let ll = log_sum_exp(&last);
        (alpha, ll)
    }

    /// Log-space backward recursion.
    pub fn backward(&self, log_b: &DMatrix<f64>) -> DMatrix<f64> {
        let t_len = log_b.nrows();
        let k = self.n_states();
        let log_a = self.log_transition();
        let mut beta = DMatrix::<f64>::zeros(t_len, k);
        if t_len == 0 {
            return beta;
        }

        let mut scratch = vec![0.0; k];
        for t in (0..t_len - 1).rev() {
            for i in 0..k {
                for j in 0..k {
                    scratch[j] = log_a[(i, j)] + log_b[(t + 1, j)] + beta[(t + 1, j)];
                }
                beta[(t, i)] = log_sum_exp(&scratch);
            }
        }
        beta
    }

    /// Run forward and backward passes over `counts`.
    pub fn posteriors(&self, counts: &DMatrix<f64>) -> Posteriors {
        let log_b = self.log_emissions(counts);
        let (log_alpha, log_likelihood) = self.forward(&log_b);
        let log_beta = self.backward(&log_b);
        Posteriors {
            log_alpha,
            log_beta,
            log_b,
            log_likelihood,
        }
    }

    pub fn log_likelihood(&self, counts: &DMatrix<f64>) -> f64 {
        let log_b = self.log_emissions(counts);
        self.forward(&log_b).1
    }

    /// Most likely state sequence (Viterbi decoding).
    pub fn states(&self, counts: &DMatrix<f64>) -> Vec<usize> {
        let log_b = self.log_emissions(counts);
        self.viterbi(&log_b)
    }

    /// Viterbi decoding over precomputed emission log-likelihoods.
    pub fn viterbi(&self, log_b: &DMatrix<f64>) -> Vec<usize> {
        let t_len = log_b.nrows();
        let k = self.n_states();
        if t_len == 0 {
            return Vec::new();
        }
        let log_a = self.log_transition();

        let mut delta = DMatrix::<f64>::from_element(t_len, k, f64::NEG_INFINITY);
        let mut psi = vec![0usize; t_len * k];
        for j in 0..k {
            delta[(0, j)] = self.initial[j].ln() + log_b[(0, j)];
        }
        for t in 1..t_len {
            for j in 0..k {
                let mut best = f64::NEG_INFINITY;
                let mut arg = 0;
                for i in 0..k {
                    let v = delta[(t - 1, i)] + log_a[(i, j)];
                    if v > best {
                        best = v;
                        arg = i;
                    }
                }
                delta[(t, j)] = best + log_b[(t, j)];
                psi[t * k + j] = arg;
            }
        }

        let mut path = vec![0usize; t_len];
        let mut best = f64::NEG_INFINITY;
        for j in 0..k {
            if delta[(t_len - 1, j)] > best {
                best = delta[(t_len - 1, j)];
                path[t_len - 1] = j;
            }
        }
        for t in (1..t_len).rev() {
            path[t - 1] = psi[t * k + path[t]];
        }
        path
    }
}

fn is_distribution(values: impl Iterator<Item = f64>) -> bool {
    let mut sum = 0.0;
    for v in values {
        if !v.is_finite() || v < 0.0 {
            return false;
        }
        sum += v;
    }
    (sum - 1.0).abs() < STOCHASTIC_TOL
}
