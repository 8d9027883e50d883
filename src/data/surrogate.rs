//! Surrogate (null-model) rasters.
//!
//! Surrogates destroy cross-unit temporal structure while keeping each unit's
//! spike count, so a model fit to them gives a baseline for the statistics
//! computed on real data. Every scheme is seeded from the raster request, so
//! independent processes derive bit-identical surrogates.

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::domain::Surrogate;
use crate::error::DataError;

/// Apply `surrogate` to a `T × U` count matrix.
pub fn apply(surrogate: &Surrogate, counts: DMatrix<f64>, seed: u64) -> Result<DMatrix<f64>, DataError> {
    match surrogate {
        Surrogate::Real => Ok(counts),
        Surrogate::Named(name) => match name.as_str() {
            "shuffle" => Ok(shuffle_bins(counts, seed)),
            "circshift" => Ok(circular_shift(counts, seed)),
            other => Err(DataError::UnknownSurrogate(other.to_string())),
        },
    }
}

/// Independently permute the time bins of every unit.
fn shuffle_bins(mut counts: DMatrix<f64>, seed: u64) -> DMatrix<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    for u in 0..counts.ncols() {
        let mut col: Vec<f64> = counts.column(u).iter().copied().collect();
        col.shuffle(&mut rng);
        for (t, v) in col.into_iter().enumerate() {
            counts[(t, u)] = v;
        }
    }
    counts
}

/// Rotate every unit's spike train by an independent random offset.
fn circular_shift(mut counts: DMatrix<f64>, seed: u64) -> DMatrix<f64> {
    let n = counts.nrows();
    if n < 2 {
        return counts;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    for u in 0..counts.ncols() {
        let mut col: Vec<f64> = counts.column(u).iter().copied().collect();
        let shift = rng.gen_range(1..n);
        col.rotate_right(shift);
        for (t, v) in col.into_iter().enumerate() {
            counts[(t, u)] = v;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts() -> DMatrix<f64> {
        DMatrix::from_fn(50, 3, |t, u| ((t * (u + 1)) % 7) as f64)
    }

    #[test]
    fn real_is_identity() {
        let c = counts();
        assert_eq!(apply(&Surrogate::Real, c.clone(), 1).unwrap(), c);
    }

    #[test]
    fn schemes_preserve_per_unit_spike_counts() {
        let c = counts();
        for scheme in ["shuffle", "circshift"] {
            let s = apply(&Surrogate::parse(scheme), c.clone(), 7).unwrap();
            assert_ne!(s, c, "{scheme} should change the raster");
            for u in 0..c.ncols() {
                assert_eq!(s.column(u).sum(), c.column(u).sum(), "{scheme} unit {u}");
            }
        }
    }

    #[test]
    fn same_seed_same_surrogate() {
        let a = apply(&Surrogate::parse("shuffle"), counts(), 42).unwrap();
        let b = apply(&Surrogate::parse("shuffle"), counts(), 42).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err = apply(&Surrogate::parse("bogus"), counts(), 0).unwrap_err();
        assert!(matches!(err, DataError::UnknownSurrogate(name) if name == "bogus"));
    }
}
