//! Shannon entropy of discrete distributions.

/// Entropy in bits of a (possibly unnormalized) non-negative weight vector.
///
/// Zero weights contribute nothing; an all-zero vector has entropy 0.
pub fn entropy_bits(weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().filter(|w| w.is_finite() && **w > 0.0).sum();
    if total <= 0.0 {
        return 0.0;
    }
    weights
        .iter()
        .filter(|w| w.is_finite() && **w > 0.0)
        .map(|&w| {
            let p = w / total;
            -p * p.log2()
        })
        .sum()
}
