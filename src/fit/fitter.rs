//! Poisson-HMM training.
//!
//! Given:
//! - a binned raster `counts` (`T × U`)
//! - the number of hidden states `K` from the model key
//! - the training library (soft or hard EM)
//!
//! we:
//! - draw a random initialization (seeded per attempt when a base seed is set)
//! - iterate EM until the log-likelihood stops improving
//! - hand back an immutable [`FittedModel`]
//!
//! The optimizer can hit degenerate steps (a state nobody occupies, an
//! underflowing likelihood). Those surface as [`FitError::Numerical`] and are
//! retried by the caller with a fresh initialization.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::Utc;
use nalgebra::{DMatrix, DVector};
use rand::prelude::*;
use rand::rngs::StdRng;

use crate::data::raster::{Raster, RasterRequest};
use crate::domain::{FittedModel, Library, ModelKey};
use crate::error::FitError;
use crate::models::PoissonHmm;

/// Posterior occupancy below which a state is considered dead.
const OCCUPANCY_FLOOR: f64 = 1e-12;
/// Lower bound on re-estimated rates so a single spike cannot zero a bin's likelihood.
const RATE_FLOOR: f64 = 1e-6;
/// Pseudo-count added to hard-EM transition counts.
const TRANSITION_PSEUDOCOUNT: f64 = 1e-3;

/// Per-call fit metadata supplied by the caller (worker or synchronous path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitContext {
    /// 1-based attempt number.
    pub attempt: u32,
    pub verbose: bool,
}

impl FitContext {
    pub fn first(verbose: bool) -> Self {
        Self { attempt: 1, verbose }
    }
}

/// Trains one model from one raster. Implementations are cache-agnostic.
pub trait Fitter: Send + Sync {
    fn fit(&self, key: &ModelKey, raster: &Raster, ctx: FitContext) -> Result<FittedModel, FitError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    pub max_iter: usize,
    /// Stop when the relative log-likelihood change drops below this.
    pub tolerance: f64,
    /// Base seed; `None` draws a fresh initialization from OS entropy.
    pub seed: Option<u64>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iter: 200,
            tolerance: 1e-6,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HmmFitter {
    opts: FitOptions,
}

impl HmmFitter {
    pub fn new(opts: FitOptions) -> Self {
        Self { opts }
    }

    pub fn options(&self) -> &FitOptions {
        &self.opts
    }

    fn rng_for(&self, key: &ModelKey, attempt: u32) -> StdRng {
        match self.opts.seed {
            Some(base) => {
                let mut hasher = DefaultHasher::new();
                base.hash(&mut hasher);
                key.hash(&mut hasher);
                attempt.hash(&mut hasher);
                StdRng::seed_from_u64(hasher.finish())
            }
            None => StdRng::from_entropy(),
        }
    }
}

impl Fitter for HmmFitter {
    fn fit(&self, key: &ModelKey, raster: &Raster, ctx: FitContext) -> Result<FittedModel, FitError> {
        validate_input(key, raster)?;
        let counts = raster.counts();
        let k = key.n_states() as usize;

        let mut rng = self.rng_for(key, ctx.attempt);
        let mut hmm = random_init(counts, k, &mut rng)?;
        let mut prev_ll = f64::NEG_INFINITY;
        let mut converged = false;
        let mut iterations = 0;

        while iterations < self.opts.max_iter {
            iterations += 1;
            let (next, ll) = match key.library() {
                Library::Default => baum_welch_step(&hmm, counts)?,
                Library::Viterbi => viterbi_step(&hmm, counts)?,
            };
            if ctx.verbose {
                tracing::info!(key = %key, attempt = ctx.attempt, iteration = iterations, log_likelihood = ll, "EM step");
            }
            hmm = next;

            let change = (ll - prev_ll).abs();
            prev_ll = ll;
            if change <= self.opts.tolerance * ll.abs().max(1.0) {
                converged = true;
                break;
            }
        }

        let log_likelihood = hmm.log_likelihood(counts);
        if !log_likelihood.is_finite() {
            return Err(FitError::Numerical("final log-likelihood is not finite".into()));
        }

        Ok(FittedModel {
            key: key.clone(),
            hmm,
            log_likelihood,
            iterations,
            converged,
            attempt: ctx.attempt,
            fitted_at: Utc::now(),
        })
    }
}

fn validate_input(key: &ModelKey, raster: &Raster) -> Result<(), FitError> {
    if raster.n_bins() == 0 || raster.n_units() == 0 {
        return Err(FitError::InvalidInput(format!(
            "raster for {key} is empty ({} bins × {} units)",
            raster.n_bins(),
            raster.n_units()
        )));
    }
    if raster.total_spikes() <= 0.0 {
        return Err(FitError::InvalidInput(format!("raster for {key} contains no spikes")));
    }
    let expected = RasterRequest::for_key(key);
    if raster.request() != &expected {
        let got = raster.request();
        return Err(FitError::InvalidInput(format!(
            "raster {}/{} bin={}ms surr={} does not belong to {key}",
            got.source, got.experiment, got.bin_size_ms, got.surrogate
        )));
    }
    if key.n_states() as usize > raster.n_bins() {
        return Err(FitError::InvalidInput(format!(
            "{} states requested but the raster has only {} bins",
            key.n_states(),
            raster.n_bins()
        )));
    }
    Ok(())
}

/// Sticky random transitions and rates scattered around each unit's mean rate.
fn random_init(counts: &DMatrix<f64>, k: usize, rng: &mut StdRng) -> Result<PoissonHmm, FitError> {
    let t_len = counts.nrows() as f64;
    let u = counts.ncols();

    let initial = DVector::from_element(k, 1.0 / k as f64);

    let mut transition = DMatrix::<f64>::zeros(k, k);
    for i in 0..k {
        for j in 0..k {
            transition[(i, j)] = rng.gen_range(0.01..1.0) + if i == j { k as f64 * 2.0 } else { 0.0 };
        }
        let row_sum = transition.row(i).sum();
        for j in 0..k {
            transition[(i, j)] /= row_sum;
        }
    }

    let mut rates = DMatrix::<f64>::zeros(k, u);
    for j in 0..u {
        let mean = counts.column(j).sum() / t_len;
        for s in 0..k {
            rates[(s, j)] = (mean * rng.gen_range(0.25..2.0)).max(RATE_FLOOR);
        }
    }

    PoissonHmm::new(initial, transition, rates)
}

/// One Baum–Welch iteration. Returns the re-estimated model and the
/// log-likelihood of the *input* model.
fn baum_welch_step(hmm: &PoissonHmm, counts: &DMatrix<f64>) -> Result<(PoissonHmm, f64), FitError> {
    let post = hmm.posteriors(counts);
    let ll = post.log_likelihood;
    if !ll.is_finite() {
        return Err(FitError::Numerical("log-likelihood is not finite".into()));
    }

    let t_len = counts.nrows();
    let k = hmm.n_states();
    let u = counts.ncols();

    // gamma[t, i] = P(state i at t | data)
    let gamma = DMatrix::from_fn(t_len, k, |t, i| (post.log_alpha[(t, i)] + post.log_beta[(t, i)] - ll).exp());

    let log_a = hmm.transition().map(|p| p.ln());
    let mut xi_sum = DMatrix::<f64>::zeros(k, k);
    for t in 0..t_len.saturating_sub(1) {
        for i in 0..k {
            let a = post.log_alpha[(t, i)];
            if a == f64::NEG_INFINITY {
                continue;
            }
            for j in 0..k {
                xi_sum[(i, j)] += (a + log_a[(i, j)] + post.log_b[(t + 1, j)] + post.log_beta[(t + 1, j)] - ll).exp();
            }
        }
    }

    let occupancy: Vec<f64> = (0..k).map(|i| gamma.column(i).sum()).collect();
    if let Some(dead) = occupancy.iter().position(|&o| !(o > OCCUPANCY_FLOOR)) {
        return Err(FitError::Numerical(format!("state {dead} has zero posterior occupancy")));
    }

    let initial_sum = gamma.row(0).sum();
    if !(initial_sum > 0.0) {
        return Err(FitError::Numerical("zero normalizer for initial distribution".into()));
    }
    let initial = DVector::from_fn(k, |i, _| gamma[(0, i)] / initial_sum);

    let mut transition = DMatrix::<f64>::zeros(k, k);
    for i in 0..k {
        let row_sum = xi_sum.row(i).sum();
        if !(row_sum > 0.0) {
            return Err(FitError::Numerical(format!("zero normalizer for transition row {i}")));
        }
        for j in 0..k {
            transition[(i, j)] = xi_sum[(i, j)] / row_sum;
        }
    }

    let weighted = gamma.transpose() * counts;
    let rates = DMatrix::from_fn(k, u, |i, j| (weighted[(i, j)] / occupancy[i]).max(RATE_FLOOR));

    Ok((PoissonHmm::new(initial, transition, rates)?, ll))
}

/// One hard-assignment (Viterbi) EM iteration.
///
/// Unvisited states keep their previous rates; only a non-finite likelihood fails.
fn viterbi_step(hmm: &PoissonHmm, counts: &DMatrix<f64>) -> Result<(PoissonHmm, f64), FitError> {
    let log_b = hmm.log_emissions(counts);
    let ll = hmm.forward(&log_b).1;
    if !ll.is_finite() {
        return Err(FitError::Numerical("log-likelihood is not finite".into()));
    }
    let path = hmm.viterbi(&log_b);

    let k = hmm.n_states();
    let u = counts.ncols();

    let mut initial = DVector::from_element(k, TRANSITION_PSEUDOCOUNT);
    initial[path[0]] += 1.0;
    let initial_sum = initial.sum();
    initial /= initial_sum;

    let mut trans_counts = DMatrix::from_element(k, k, TRANSITION_PSEUDOCOUNT);
    for w in path.windows(2) {
        trans_counts[(w[0], w[1])] += 1.0;
    }
    let mut transition = DMatrix::<f64>::zeros(k, k);
    for i in 0..k {
        let row_sum = trans_counts.row(i).sum();
        for j in 0..k {
            transition[(i, j)] = trans_counts[(i, j)] / row_sum;
        }
    }

    let mut visits = vec![0usize; k];
    let mut sums = DMatrix::<f64>::zeros(k, u);
    for (t, &s) in path.iter().enumerate() {
        visits[s] += 1;
        for j in 0..u {
            sums[(s, j)] += counts[(t, j)];
        }
    }
    let rates = DMatrix::from_fn(k, u, |i, j| {
        if visits[i] == 0 {
            hmm.rates()[(i, j)]
        } else {
            (sums[(i, j)] / visits[i] as f64).max(RATE_FLOOR)
        }
    });

    Ok((PoissonHmm::new(initial, transition, rates)?, ll))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Surrogate;
    use rand_distr::Poisson;

    /// Alternating quiet/active blocks of 20 bins on 4 units.
    fn planted(key: &ModelKey) -> (Raster, Vec<usize>) {
        let mut rng = StdRng::seed_from_u64(7);
        let quiet = Poisson::new(0.2).unwrap();
        let active = Poisson::new(4.0).unwrap();
        let t_len = 400;
        let truth: Vec<usize> = (0..t_len).map(|t| (t / 20) % 2).collect();
        let counts = DMatrix::from_fn(t_len, 4, |t, _| {
            if truth[t] == 1 {
                active.sample(&mut rng)
            } else {
                quiet.sample(&mut rng)
            }
        });
        (Raster::from_counts(RasterRequest::for_key(key), counts), truth)
    }

    fn key(n_states: u32, library: Library) -> ModelKey {
        ModelKey::new("A", "e1", 30, n_states, Surrogate::Real, library).unwrap()
    }

    fn fitter() -> HmmFitter {
        HmmFitter::new(FitOptions {
            seed: Some(11),
            ..FitOptions::default()
        })
    }

    fn agreement(path: &[usize], truth: &[usize]) -> f64 {
        let same = path.iter().zip(truth).filter(|(a, b)| a == b).count() as f64 / truth.len() as f64;
        same.max(1.0 - same)
    }

    #[test]
    fn baum_welch_recovers_planted_states() {
        let key = key(2, Library::Default);
        let (raster, truth) = planted(&key);
        let model = fitter().fit(&key, &raster, FitContext::first(false)).unwrap();

        assert_eq!(model.key, key);
        assert_eq!(model.attempt, 1);
        assert!(model.log_likelihood.is_finite());
        let path = model.hmm.states(raster.counts());
        assert!(agreement(&path, &truth) > 0.95);
    }

    #[test]
    fn viterbi_training_recovers_planted_states() {
        let key = key(2, Library::Viterbi);
        let (raster, truth) = planted(&key);
        let model = fitter().fit(&key, &raster, FitContext::first(false)).unwrap();
        let path = model.hmm.states(raster.counts());
        assert!(agreement(&path, &truth) > 0.95);
    }

    #[test]
    fn attempt_number_is_recorded() {
        let key = key(2, Library::Default);
        let (raster, _) = planted(&key);
        let ctx = FitContext {
            attempt: 2,
            verbose: false,
        };
        let model = fitter().fit(&key, &raster, ctx).unwrap();
        assert_eq!(model.attempt, 2);
    }

    #[test]
    fn mismatched_raster_is_invalid_input() {
        let key = key(2, Library::Default);
        // `n_states` and `library` are not part of the raster request.
        let (raster, _) = planted(&key.with_states(3).unwrap());
        assert!(fitter().fit(&key, &raster, FitContext::first(false)).is_ok());

        let other = ModelKey::new("A", "e1", 10, 2, Surrogate::Real, Library::Default).unwrap();
        let err = fitter().fit(&other, &raster, FitContext::first(false)).unwrap_err();
        assert!(matches!(err, FitError::InvalidInput(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn too_many_states_is_invalid_input() {
        let key = key(15, Library::Default);
        let counts = DMatrix::from_element(5, 2, 1.0);
        let raster = Raster::from_counts(RasterRequest::for_key(&key), counts);
        let err = fitter().fit(&key, &raster, FitContext::first(false)).unwrap_err();
        assert!(matches!(err, FitError::InvalidInput(_)));
    }

    #[test]
    fn silent_raster_is_invalid_input() {
        let key = key(2, Library::Default);
        let raster = Raster::from_counts(RasterRequest::for_key(&key), DMatrix::zeros(50, 3));
        let err = fitter().fit(&key, &raster, FitContext::first(false)).unwrap_err();
        assert!(matches!(err, FitError::InvalidInput(_)));
    }

    #[test]
    fn dead_state_is_a_numerical_failure() {
        // State 1 emits at a rate no bin can come from, so it never gets occupancy.
        let hmm = PoissonHmm::new(
            DVector::from_vec(vec![1.0, 0.0]),
            DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.5, 0.5]),
            DMatrix::from_row_slice(2, 1, &[1.0, 50.0]),
        )
        .unwrap();
        let counts = DMatrix::from_element(30, 1, 1.0);
        let err = baum_welch_step(&hmm, &counts).unwrap_err();
        assert!(err.is_transient());
    }
}
