//! Reporting: per-experiment sweep summaries and formatted terminal output.

pub mod format;

pub use format::*;

use crate::data::{BurstOptions, Raster, UnitOrder};
use crate::models::EntropyProfile;

const TOP_UNITS: usize = 5;

/// Entropy statistics of one model (one state count) on one experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntropy {
    pub n_states: u32,
    /// Burst-aligned entropy averaged over the window (bits).
    pub mean_entropy: f64,
    /// Entropy of randomly anchored windows (bits).
    pub baseline_entropy: f64,
    pub n_bursts: usize,
}

impl StateEntropy {
    pub fn from_profile(n_states: u32, profile: &EntropyProfile) -> Self {
        let mean_entropy = if profile.mean_entropy.is_empty() {
            0.0
        } else {
            profile.mean_entropy.iter().sum::<f64>() / profile.mean_entropy.len() as f64
        };
        Self {
            n_states,
            mean_entropy,
            baseline_entropy: profile.baseline_entropy,
            n_bursts: profile.n_bursts,
        }
    }
}

/// What a sweep learned about one experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentSummary {
    pub experiment: String,
    pub n_units: usize,
    pub total_rate_khz: f64,
    pub n_bursts: usize,
    /// 1-based ids of the first units in the metrics ordering.
    pub top_units: Vec<usize>,
    /// One entry per available model, ordered by state count.
    pub models: Vec<StateEntropy>,
    /// State counts whose model was unavailable.
    pub missing: Vec<u32>,
}

impl ExperimentSummary {
    pub fn new(raster: &Raster, bursts: &BurstOptions, order: &UnitOrder) -> Self {
        Self {
            experiment: raster.experiment().to_string(),
            n_units: raster.n_units(),
            total_rate_khz: raster.total_rate_khz(),
            n_bursts: raster.find_bursts(bursts).len(),
            top_units: order.order.iter().take(TOP_UNITS).map(|u| u + 1).collect(),
            models: Vec::new(),
            missing: Vec::new(),
        }
    }

    pub fn push_model(&mut self, entry: StateEntropy) {
        let at = self.models.partition_point(|m| m.n_states < entry.n_states);
        self.models.insert(at, entry);
    }

    pub fn push_missing(&mut self, n_states: u32) {
        let at = self.missing.partition_point(|&n| n < n_states);
        self.missing.insert(at, n_states);
    }

    /// Mean burst entropy across available models.
    pub fn mean_entropy(&self) -> Option<f64> {
        mean(self.models.iter().map(|m| m.mean_entropy))
    }

    /// Mean and standard deviation of the baseline entropy across models.
    pub fn baseline_stats(&self) -> Option<(f64, f64)> {
        let mu = mean(self.models.iter().map(|m| m.baseline_entropy))?;
        let var = self
            .models
            .iter()
            .map(|m| (m.baseline_entropy - mu).powi(2))
            .sum::<f64>()
            / self.models.len() as f64;
        Some((mu, var.sqrt()))
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n_states: u32, mean_entropy: f64, baseline_entropy: f64) -> StateEntropy {
        StateEntropy {
            n_states,
            mean_entropy,
            baseline_entropy,
            n_bursts: 3,
        }
    }

    fn summary() -> ExperimentSummary {
        ExperimentSummary {
            experiment: "e1".into(),
            n_units: 12,
            total_rate_khz: 0.03,
            n_bursts: 3,
            top_units: Vec::new(),
            models: Vec::new(),
            missing: Vec::new(),
        }
    }

    #[test]
    fn models_stay_sorted_by_state_count() {
        let mut s = summary();
        s.push_model(entry(12, 1.0, 2.0));
        s.push_model(entry(10, 1.0, 2.0));
        s.push_missing(15);
        s.push_missing(11);
        assert_eq!(s.models.iter().map(|m| m.n_states).collect::<Vec<_>>(), vec![10, 12]);
        assert_eq!(s.missing, vec![11, 15]);
    }

    #[test]
    fn averages_across_models() {
        let mut s = summary();
        assert_eq!(s.mean_entropy(), None);
        assert_eq!(s.baseline_stats(), None);

        s.push_model(entry(10, 1.0, 2.0));
        s.push_model(entry(11, 2.0, 4.0));
        assert_eq!(s.mean_entropy(), Some(1.5));
        let (mu, sd) = s.baseline_stats().unwrap();
        assert_eq!(mu, 3.0);
        assert_eq!(sd, 1.0);
    }
}
