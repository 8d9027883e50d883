//! Per-experiment unit ordering from precomputed metrics files.
//!
//! `<metrics_dir>/<experiment>.json` may carry a `mean_rate_ordering` array of
//! 1-based unit indices. Anything missing or malformed falls back to the
//! identity ordering with a warning; ordering is cosmetic and never fatal.

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOrder {
    /// `order[i]` is the unit shown at position `i`.
    pub order: Vec<usize>,
    /// `inverse[u]` is the position of unit `u`.
    pub inverse: Vec<usize>,
}

impl UnitOrder {
    pub fn identity(n_units: usize) -> Self {
        let order: Vec<usize> = (0..n_units).collect();
        Self {
            inverse: order.clone(),
            order,
        }
    }

    /// Build from a 0-based permutation; `None` unless it is a permutation of `0..n`.
    pub fn from_permutation(order: Vec<usize>) -> Option<Self> {
        let n = order.len();
        let mut inverse = vec![usize::MAX; n];
        for (pos, &unit) in order.iter().enumerate() {
            if unit >= n || inverse[unit] != usize::MAX {
                return None;
            }
            inverse[unit] = pos;
        }
        Some(Self { order, inverse })
    }
}

#[derive(Debug, Deserialize)]
struct MetricsFile {
    mean_rate_ordering: Option<Vec<i64>>,
}

/// Load the unit ordering for `experiment`, or the identity ordering.
pub fn load_unit_order(metrics_dir: &Path, experiment: &str, n_units: usize) -> UnitOrder {
    let path = metrics_dir.join(format!("{experiment}.json"));
    match read_ordering(&path, n_units) {
        Ok(order) => order,
        Err(reason) => {
            tracing::warn!(
                experiment,
                path = %path.display(),
                reason = %reason,
                "metrics not found, using identity unit order"
            );
            UnitOrder::identity(n_units)
        }
    }
}

fn read_ordering(path: &Path, n_units: usize) -> Result<UnitOrder, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let metrics: MetricsFile = serde_json::from_str(&text).map_err(|e| e.to_string())?;
    let one_based = metrics
        .mean_rate_ordering
        .ok_or_else(|| "no `mean_rate_ordering` field".to_string())?;
    if one_based.len() != n_units {
        return Err(format!(
            "ordering has {} entries, raster has {n_units} units",
            one_based.len()
        ));
    }
    let order: Vec<usize> = one_based
        .into_iter()
        .map(|i| usize::try_from(i - 1).map_err(|_| format!("index {i} is not 1-based")))
        .collect::<Result<_, _>>()?;
    UnitOrder::from_permutation(order).ok_or_else(|| "ordering is not a permutation".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_one_based_ordering_and_inverse() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("e1.json"),
            r#"{"mean_rate_ordering": [3, 1, 2], "other": 5}"#,
        )
        .unwrap();

        let order = load_unit_order(dir.path(), "e1", 3);
        assert_eq!(order.order, vec![2, 0, 1]);
        assert_eq!(order.inverse, vec![1, 2, 0]);
    }

    #[test]
    fn missing_or_invalid_metrics_fall_back_to_identity() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_unit_order(dir.path(), "nope", 4), UnitOrder::identity(4));

        std::fs::write(dir.path().join("dup.json"), r#"{"mean_rate_ordering": [1, 1, 2]}"#).unwrap();
        assert_eq!(load_unit_order(dir.path(), "dup", 3), UnitOrder::identity(3));

        std::fs::write(dir.path().join("short.json"), r#"{"mean_rate_ordering": [1]}"#).unwrap();
        assert_eq!(load_unit_order(dir.path(), "short", 3), UnitOrder::identity(3));
    }
}
