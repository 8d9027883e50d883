//! Spike-time CSV ingest.
//!
//! Turns a `unit,time_ms` CSV into the list of spikes a raster is binned from.
//!
//! Design goals:
//! - **Strict schema** for required columns (clear errors)
//! - **Row-level validation** (skip bad rows, but report what happened)
//! - **Deterministic behavior** (no hidden randomness)
//! - **Separation of concerns**: no binning or fitting logic here

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use csv::StringRecord;

use crate::error::DataError;

/// A row-level error encountered during ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub line: usize,
    pub message: String,
}

/// Ingest output: spikes + row errors + summary stats.
#[derive(Debug, Clone)]
pub struct SpikeTable {
    /// `(unit index, spike time in ms)`.
    pub spikes: Vec<(usize, f64)>,
    /// `max(unit) + 1`.
    pub n_units: usize,
    /// Last spike time; the recording is assumed to start at 0.
    pub duration_ms: f64,
    pub row_errors: Vec<RowError>,
    pub rows_read: usize,
}

/// Load a spike CSV with `unit` and `time_ms` columns (extra columns are ignored).
pub fn load_spike_csv(path: &Path) -> Result<SpikeTable, DataError> {
    let file = File::open(path).map_err(|e| DataError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    read_spike_csv(file, path)
}

/// Parse spike CSV content from any reader. `path` is only used in error messages.
pub fn read_spike_csv<R: std::io::Read>(input: R, path: &Path) -> Result<SpikeTable, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);

    let headers = reader
        .headers()
        .map_err(|e| DataError::Parse {
            path: path.to_path_buf(),
            message: format!("failed to read CSV headers: {e}"),
        })?
        .clone();
    let header_map = build_header_map(&headers);

    let (Some(&unit_col), Some(&time_col)) = (header_map.get("unit"), header_map.get("time_ms")) else {
        return Err(DataError::Parse {
            path: path.to_path_buf(),
            message: "missing required columns: `unit`, `time_ms`".to_string(),
        });
    };

    let mut spikes = Vec::new();
    let mut row_errors = Vec::new();
    let mut rows_read = 0usize;

    for (idx, result) in reader.records().enumerate() {
        // +2: records() starts after the header and lines are 1-based.
        let line = idx + 2;
        rows_read += 1;

        let record = match result {
            Ok(r) => r,
            Err(e) => {
                row_errors.push(RowError {
                    line,
                    message: format!("CSV parse error: {e}"),
                });
                continue;
            }
        };

        match parse_row(&record, unit_col, time_col) {
            Ok(spike) => spikes.push(spike),
            Err(message) => row_errors.push(RowError { line, message }),
        }
    }

    if spikes.is_empty() {
        return Err(DataError::Empty(path.display().to_string()));
    }

    let n_units = spikes.iter().map(|(u, _)| u + 1).max().unwrap_or(0);
    let duration_ms = spikes.iter().map(|(_, t)| *t).fold(0.0, f64::max);

    Ok(SpikeTable {
        spikes,
        n_units,
        duration_ms,
        row_errors,
        rows_read,
    })
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> String {
    // Spreadsheet exports sometimes prefix the first header with a UTF-8 BOM.
    let name = name.trim().trim_start_matches('\u{feff}');
    name.to_ascii_lowercase()
}

fn parse_row(record: &StringRecord, unit_col: usize, time_col: usize) -> Result<(usize, f64), String> {
    let unit_raw = record.get(unit_col).unwrap_or("").trim();
    let time_raw = record.get(time_col).unwrap_or("").trim();

    let unit: usize = unit_raw
        .parse()
        .map_err(|_| format!("Invalid `unit` value '{unit_raw}'."))?;
    let time_ms: f64 = time_raw
        .parse()
        .map_err(|_| format!("Invalid `time_ms` value '{time_raw}'."))?;

    if !time_ms.is_finite() || time_ms < 0.0 {
        return Err(format!("Spike time must be finite and >= 0 (got {time_ms})."));
    }
    Ok((unit, time_ms))
}
