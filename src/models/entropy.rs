//! Burst-aligned state statistics.
//!
//! Given a decoded state sequence and the burst peaks of a raster, compute the
//! probability of observing each state at every offset of the burst window and
//! the Shannon entropy of that distribution. The baseline is the same statistic
//! over windows aligned to random bins instead of burst peaks.

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::data::raster::{BurstOptions, Raster};
use crate::math::entropy_bits;
use crate::models::hmm::PoissonHmm;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntropyOptions {
    pub bursts: BurstOptions,
    /// Number of randomly aligned windows for the baseline.
    pub baseline_windows: usize,
}

impl Default for EntropyOptions {
    fn default() -> Self {
        Self {
            bursts: BurstOptions::default(),
            baseline_windows: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntropyProfile {
    /// Window offsets relative to the peak, in bins.
    pub margins: (isize, isize),
    /// `state_probs[(k, i)]`: probability of state `k` at window offset `i`.
    pub state_probs: DMatrix<f64>,
    /// Entropy in bits of each column of `state_probs`.
    pub mean_entropy: Vec<f64>,
    /// Mean entropy over randomly aligned windows.
    pub baseline_entropy: f64,
    pub n_bursts: usize,
}

impl EntropyProfile {
    pub fn window_len(&self) -> usize {
        self.mean_entropy.len()
    }

    /// Offset (in bins, relative to the peak) of column `i`.
    pub fn offset(&self, i: usize) -> isize {
        self.margins.0 + i as isize
    }
}

/// Decode `raster` with `hmm` and compute its burst-aligned entropy profile.
pub fn compute_entropy(hmm: &PoissonHmm, raster: &Raster, opts: &EntropyOptions) -> EntropyProfile {
    let states = hmm.states(raster.counts());
    let peaks = raster.find_bursts(&opts.bursts);
    profile_from_states(&states, hmm.n_states(), &peaks, opts, raster.id())
}

/// Build a profile from a decoded state sequence and burst peak bins.
///
/// Peaks whose window does not fit inside `states` are skipped.
pub fn profile_from_states(
    states: &[usize],
    n_states: usize,
    peaks: &[usize],
    opts: &EntropyOptions,
    seed: u64,
) -> EntropyProfile {
    let margins = normalized_margins(opts.bursts.margins);
    let state_probs = observed_state_probs(states, n_states, peaks, margins);
    let mean_entropy = column_entropies(&state_probs);
    let n_bursts = peaks
        .iter()
        .filter(|&&p| window_fits(p, margins, states.len()))
        .count();

    EntropyProfile {
        margins,
        state_probs,
        mean_entropy,
        baseline_entropy: baseline_entropy(states, n_states, margins, opts.baseline_windows, seed),
        n_bursts,
    }
}

fn normalized_margins((left, right): (isize, isize)) -> (isize, isize) {
    (left.min(0), right.max(0))
}

fn window_len(margins: (isize, isize)) -> usize {
    (margins.1 - margins.0 + 1) as usize
}

fn window_fits(peak: usize, margins: (isize, isize), len: usize) -> bool {
    let lo = peak as isize + margins.0;
    let hi = peak as isize + margins.1;
    lo >= 0 && hi < len as isize
}

/// Fraction of windows in which each state is observed at each offset.
fn observed_state_probs(
    states: &[usize],
    n_states: usize,
    anchors: &[usize],
    margins: (isize, isize),
) -> DMatrix<f64> {
    let width = window_len(margins);
    let mut probs = DMatrix::<f64>::zeros(n_states, width);
    let mut used = 0usize;
    for &anchor in anchors {
        if !window_fits(anchor, margins, states.len()) {
            continue;
        }
        used += 1;
        let start = (anchor as isize + margins.0) as usize;
        for (i, &s) in states[start..start + width].iter().enumerate() {
            if s < n_states {
                probs[(s, i)] += 1.0;
            }
        }
    }
    if used > 0 {
        probs /= used as f64;
    }
    probs
}

fn column_entropies(probs: &DMatrix<f64>) -> Vec<f64> {
    (0..probs.ncols())
        .map(|i| {
            let col: Vec<f64> = probs.column(i).iter().copied().collect();
            entropy_bits(&col)
        })
        .collect()
}

fn baseline_entropy(
    states: &[usize],
    n_states: usize,
    margins: (isize, isize),
    windows: usize,
    seed: u64,
) -> f64 {
    let width = window_len(margins);
    if windows == 0 || states.len() < width {
        return 0.0;
    }
    let lo = (-margins.0) as usize;
    let hi = states.len() - margins.1 as usize;
    let mut rng = StdRng::seed_from_u64(seed);
    let anchors: Vec<usize> = (0..windows).map(|_| rng.gen_range(lo..hi)).collect();

    let probs = observed_state_probs(states, n_states, &anchors, margins);
    let ents = column_entropies(&probs);
    ents.iter().sum::<f64>() / ents.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(margins: (isize, isize)) -> EntropyOptions {
        EntropyOptions {
            bursts: BurstOptions {
                rms_factor: 4.0,
                margins,
            },
            baseline_windows: 50,
        }
    }

    #[test]
    fn stereotyped_bursts_have_zero_entropy() {
        // Every burst runs states 1 -> 2 -> 1 around its peak.
        let mut states = vec![0usize; 60];
        for peak in [10, 30, 50] {
            states[peak - 1] = 1;
            states[peak] = 2;
            states[peak + 1] = 1;
        }
        let p = profile_from_states(&states, 3, &[10, 30, 50], &opts((-2, 2)), 1);

        assert_eq!(p.n_bursts, 3);
        assert_eq!(p.window_len(), 5);
        assert_eq!(p.offset(0), -2);
        assert!(p.mean_entropy.iter().all(|&h| h.abs() < 1e-12));
        assert_eq!(p.state_probs[(2, 2)], 1.0);
        assert_eq!(p.state_probs[(1, 1)], 1.0);
        // Random windows mix states, so the baseline is higher.
        assert!(p.baseline_entropy > 0.0);
    }

    #[test]
    fn entropy_is_bounded_by_log2_of_state_count() {
        let states: Vec<usize> = (0..500).map(|t| (t * 7 + t / 3) % 4).collect();
        let peaks: Vec<usize> = (20..480).step_by(13).collect();
        let p = profile_from_states(&states, 4, &peaks, &opts((-5, 5)), 9);
        let bound = 2.0 + 1e-12;
        assert!(p.mean_entropy.iter().all(|&h| (0.0..=bound).contains(&h)));
        assert!((0.0..=bound).contains(&p.baseline_entropy));
        for i in 0..p.window_len() {
            assert!((p.state_probs.column(i).sum() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn out_of_range_peaks_are_ignored() {
        let states = vec![0usize; 10];
        let p = profile_from_states(&states, 2, &[0, 9], &opts((-2, 2)), 0);
        assert_eq!(p.n_bursts, 0);
        assert!(p.state_probs.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn baseline_is_deterministic_per_seed() {
        let states: Vec<usize> = (0..300).map(|t| (t / 5) % 3).collect();
        let a = profile_from_states(&states, 3, &[100], &opts((-3, 3)), 42);
        let b = profile_from_states(&states, 3, &[100], &opts((-3, 3)), 42);
        assert_eq!(a.baseline_entropy, b.baseline_entropy);
    }
}
