//! Binned spike rasters.
//!
//! A raster is the fitter's only input: a `T × U` matrix of spike counts per time
//! bin and unit, tagged with the key fields it was built for.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use nalgebra::DMatrix;

use crate::domain::{ModelKey, Surrogate};

/// The key fields a raster provider needs (everything except `n_states`/`library`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RasterRequest {
    pub source: String,
    pub experiment: String,
    pub bin_size_ms: u32,
    pub surrogate: Surrogate,
}

impl RasterRequest {
    pub fn for_key(key: &ModelKey) -> Self {
        Self {
            source: key.source().to_string(),
            experiment: key.experiment().to_string(),
            bin_size_ms: key.bin_size_ms(),
            surrogate: key.surrogate().clone(),
        }
    }

    /// Deterministic seed for surrogate generation; identical in every process.
    pub fn seed(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Burst detection settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BurstOptions {
    /// A bin belongs to a burst when the population count exceeds
    /// `rms_factor × RMS(population count)`.
    pub rms_factor: f64,
    /// Window around each peak, in bins (`left <= 0 <= right`). Peaks whose
    /// window would leave the raster are dropped.
    pub margins: (isize, isize),
}

impl Default for BurstOptions {
    fn default() -> Self {
        Self {
            rms_factor: 4.0,
            margins: (-10, 20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Raster {
    request: RasterRequest,
    counts: DMatrix<f64>,
    id: u64,
}

impl Raster {
    /// Build a raster from a `T × U` count matrix.
    pub fn from_counts(request: RasterRequest, counts: DMatrix<f64>) -> Self {
        let id = content_id(&request, &counts);
        Self { request, counts, id }
    }

    /// Bin spike times (`(unit, time_ms)`) into a raster covering `[0, duration_ms)`.
    ///
    /// Spikes outside the window or on units `>= n_units` are ignored.
    pub fn from_spikes(
        request: RasterRequest,
        n_units: usize,
        spikes: &[(usize, f64)],
        duration_ms: f64,
    ) -> Self {
        let bin = f64::from(request.bin_size_ms.max(1));
        let n_bins = ((duration_ms / bin).ceil() as usize).max(1);
        let mut counts = DMatrix::<f64>::zeros(n_bins, n_units);
        for &(unit, t_ms) in spikes {
            if unit >= n_units || !t_ms.is_finite() || t_ms < 0.0 {
                continue;
            }
            let b = (t_ms / bin).floor() as usize;
            if b < n_bins {
                counts[(b, unit)] += 1.0;
            }
        }
        Self::from_counts(request, counts)
    }

    pub fn request(&self) -> &RasterRequest {
        &self.request
    }

    pub fn experiment(&self) -> &str {
        &self.request.experiment
    }

    pub fn bin_size_ms(&self) -> u32 {
        self.request.bin_size_ms
    }

    pub fn counts(&self) -> &DMatrix<f64> {
        &self.counts
    }

    /// Content hash identifying this raster for memoization.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn n_bins(&self) -> usize {
        self.counts.nrows()
    }

    pub fn n_units(&self) -> usize {
        self.counts.ncols()
    }

    pub fn total_spikes(&self) -> f64 {
        self.counts.sum()
    }

    pub fn duration_s(&self) -> f64 {
        self.n_bins() as f64 * f64::from(self.request.bin_size_ms) / 1000.0
    }

    /// Per-unit firing rates in Hz.
    pub fn rates_hz(&self) -> Vec<f64> {
        let dur = self.duration_s();
        if dur <= 0.0 {
            return vec![0.0; self.n_units()];
        }
        (0..self.n_units())
            .map(|u| self.counts.column(u).sum() / dur)
            .collect()
    }

    /// Summed firing rate of all units in kHz.
    pub fn total_rate_khz(&self) -> f64 {
        self.rates_hz().iter().sum::<f64>() / 1000.0
    }

    /// Spike count per bin summed over units.
    pub fn population_counts(&self) -> Vec<f64> {
        (0..self.n_bins()).map(|t| self.counts.row(t).sum()).collect()
    }

    /// Bin indices of population-burst peaks.
    ///
    /// Bursts are maximal runs of bins above the RMS threshold; each run yields
    /// its highest bin (first one on ties).
    pub fn find_bursts(&self, opts: &BurstOptions) -> Vec<usize> {
        let pop = self.population_counts();
        if pop.is_empty() {
            return Vec::new();
        }
        let rms = (pop.iter().map(|v| v * v).sum::<f64>() / pop.len() as f64).sqrt();
        let threshold = opts.rms_factor * rms;
        if !(threshold.is_finite() && threshold > 0.0) {
            return Vec::new();
        }

        let (left, right) = opts.margins;
        let in_bounds = |peak: usize| {
            let lo = peak as isize + left;
            let hi = peak as isize + right;
            lo >= 0 && hi < pop.len() as isize
        };

        let mut peaks = Vec::new();
        let mut run: Option<usize> = None;
        for (t, &v) in pop.iter().enumerate() {
            if v > threshold {
                run = match run {
                    Some(best) if pop[best] >= v => Some(best),
                    _ => Some(t),
                };
            } else if let Some(best) = run.take() {
                if in_bounds(best) {
                    peaks.push(best);
                }
            }
        }
        if let Some(best) = run {
            if in_bounds(best) {
                peaks.push(best);
            }
        }
        peaks
    }
}

fn content_id(request: &RasterRequest, counts: &DMatrix<f64>) -> u64 {
    let mut hasher = DefaultHasher::new();
    request.hash(&mut hasher);
    counts.nrows().hash(&mut hasher);
    counts.ncols().hash(&mut hasher);
    for v in counts.iter() {
        v.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RasterRequest {
        RasterRequest {
            source: "A".into(),
            experiment: "e1".into(),
            bin_size_ms: 10,
            surrogate: Surrogate::Real,
        }
    }

    #[test]
    fn spikes_are_binned_by_bin_size() {
        let spikes = [(0, 0.0), (0, 9.9), (1, 10.0), (1, 35.0), (2, 5.0), (0, 1000.0)];
        let r = Raster::from_spikes(request(), 2, &spikes, 40.0);
        assert_eq!(r.n_bins(), 4);
        assert_eq!(r.n_units(), 2);
        assert_eq!(r.counts()[(0, 0)], 2.0);
        assert_eq!(r.counts()[(1, 1)], 1.0);
        assert_eq!(r.counts()[(3, 1)], 1.0);
        // unit 2 and the out-of-window spike are dropped
        assert_eq!(r.total_spikes(), 4.0);
    }

    #[test]
    fn rates_are_reported_in_hz() {
        let spikes: Vec<(usize, f64)> = (0..10).map(|i| (0, i as f64 * 100.0)).collect();
        let r = Raster::from_spikes(request(), 1, &spikes, 1000.0);
        assert!((r.rates_hz()[0] - 10.0).abs() < 1e-12);
        assert!((r.total_rate_khz() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn bursts_are_peaks_of_runs_above_threshold() {
        let mut pop = vec![1.0; 40];
        pop[10] = 20.0;
        pop[11] = 30.0;
        pop[12] = 25.0;
        pop[30] = 40.0;
        let counts = DMatrix::from_fn(40, 1, |t, _| pop[t]);
        let r = Raster::from_counts(request(), counts);

        let opts = BurstOptions {
            rms_factor: 1.5,
            margins: (-5, 5),
        };
        assert_eq!(r.find_bursts(&opts), vec![11, 30]);

        // A window that does not fit drops the late peak.
        let opts = BurstOptions {
            rms_factor: 1.5,
            margins: (-5, 10),
        };
        assert_eq!(r.find_bursts(&opts), vec![11]);
    }

    #[test]
    fn id_tracks_content() {
        let a = Raster::from_spikes(request(), 1, &[(0, 1.0)], 20.0);
        let b = Raster::from_spikes(request(), 1, &[(0, 1.0)], 20.0);
        let c = Raster::from_spikes(request(), 1, &[(0, 11.0)], 20.0);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }
}
