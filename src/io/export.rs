//! CSV exports.
//!
//! - entropy profiles, one row per (experiment, state count, offset), for
//!   spreadsheets or downstream plotting
//! - spike tables in the `unit,time_ms` layout read by `io::ingest`

use std::fs;
use std::path::Path;

use crate::error::AppError;
use crate::models::EntropyProfile;

/// One exported profile.
#[derive(Debug, Clone, Copy)]
pub struct ProfileRow<'a> {
    pub experiment: &'a str,
    pub n_states: u32,
    pub bin_size_ms: u32,
    pub profile: &'a EntropyProfile,
}

/// Write entropy profiles to a CSV file.
///
/// Columns: `experiment,n_states,offset_bins,offset_ms,entropy_bits,baseline_bits,n_bursts`.
pub fn write_entropy_csv(path: &Path, rows: &[ProfileRow<'_>]) -> Result<(), AppError> {
    create_parent(path)?;
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| AppError::new(4, format!("Failed to create export CSV '{}': {e}", path.display())))?;

    writer
        .write_record([
            "experiment",
            "n_states",
            "offset_bins",
            "offset_ms",
            "entropy_bits",
            "baseline_bits",
            "n_bursts",
        ])
        .map_err(|e| AppError::new(4, format!("Failed to write export CSV header: {e}")))?;

    for row in rows {
        let p = row.profile;
        for (i, h) in p.mean_entropy.iter().enumerate() {
            let offset = p.offset(i);
            writer
                .write_record([
                    row.experiment.to_string(),
                    row.n_states.to_string(),
                    offset.to_string(),
                    (offset * row.bin_size_ms as isize).to_string(),
                    format!("{h:.6}"),
                    format!("{:.6}", p.baseline_entropy),
                    p.n_bursts.to_string(),
                ])
                .map_err(|e| AppError::new(4, format!("Failed to write export CSV row: {e}")))?;
        }
    }

    writer
        .flush()
        .map_err(|e| AppError::new(4, format!("Failed to flush export CSV '{}': {e}", path.display())))
}

/// Write `(unit, time_ms)` spikes as a `unit,time_ms` CSV file.
pub fn write_spike_csv(path: &Path, spikes: &[(usize, f64)]) -> Result<(), AppError> {
    create_parent(path)?;
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| AppError::new(4, format!("Failed to create spike CSV '{}': {e}", path.display())))?;

    writer
        .write_record(["unit", "time_ms"])
        .map_err(|e| AppError::new(4, format!("Failed to write spike CSV header: {e}")))?;
    for &(unit, t) in spikes {
        writer
            .write_record([unit.to_string(), format!("{t:.3}")])
            .map_err(|e| AppError::new(4, format!("Failed to write spike CSV row: {e}")))?;
    }

    writer
        .flush()
        .map_err(|e| AppError::new(4, format!("Failed to flush spike CSV '{}': {e}", path.display())))
}

fn create_parent(path: &Path) -> Result<(), AppError> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir)
            .map_err(|e| AppError::new(4, format!("Failed to create directory '{}': {e}", dir.display()))),
        _ => Ok(()),
    }
}
