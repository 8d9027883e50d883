//! Log-space helpers for HMM likelihoods.
//!
//! Spike rasters are long (tens of thousands of bins), so forward/backward
//! recursions run in log space to avoid underflow.

/// Numerically stable `ln(Σ exp(x_i))`.
///
/// Returns `-inf` for an empty slice or when every term is `-inf`.
pub fn log_sum_exp(xs: &[f64]) -> f64 {
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = xs.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

/// `ln(k!)`, exact up to 20 and Stirling's series beyond.
pub fn ln_factorial(k: u64) -> f64 {
    if k <= 20 {
        let mut acc = 1.0_f64;
        for i in 2..=k {
            acc *= i as f64;
        }
        return acc.ln();
    }
    let n = k as f64;
    // Stirling with the first two correction terms; error < 1e-10 for n > 20.
    n * n.ln() - n + 0.5 * (2.0 * std::f64::consts::PI * n).ln() + 1.0 / (12.0 * n)
        - 1.0 / (360.0 * n * n * n)
}

/// Poisson log-pmf `ln P(k | λ)`.
///
/// `λ = 0` is allowed: it yields `0` for `k = 0` and `-inf` otherwise.
pub fn poisson_ln_pmf(k: f64, lambda: f64) -> f64 {
    if k <= 0.0 {
        return -lambda;
    }
    if lambda <= 0.0 {
        return f64::NEG_INFINITY;
    }
    k * lambda.ln() - lambda - ln_factorial(k.round() as u64)
}
