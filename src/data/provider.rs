//! Raster providers: where the fitter's input comes from.
//!
//! The cache/queue core treats raster loading as an external collaborator behind
//! [`RasterProvider`]. Two implementations ship with the crate:
//!
//! - [`CsvRasterProvider`]: spike-time CSVs under `<data_dir>/<source>/<experiment>.csv`
//! - `SyntheticRasterProvider` (in `data::sample`): generated rasters for demos/tests

use std::path::{Path, PathBuf};

use crate::data::raster::{Raster, RasterRequest};
use crate::data::surrogate;
use crate::error::DataError;
use crate::io::ingest::load_spike_csv;

/// Source of binned rasters for a `(source, experiment, bin, surrogate)` request.
pub trait RasterProvider: Send + Sync {
    fn load(&self, request: &RasterRequest) -> Result<Raster, DataError>;

    /// All experiment names available for `source`, sorted.
    fn experiments(&self, source: &str) -> Result<Vec<String>, DataError>;
}

/// Reads `<root>/<source>/<experiment>.csv` spike-time files.
#[derive(Debug, Clone)]
pub struct CsvRasterProvider {
    root: PathBuf,
}

impl CsvRasterProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<root>/<source>/<experiment>.csv`; names that would leave `root` are rejected.
    pub fn path_for(&self, source: &str, experiment: &str) -> Result<PathBuf, DataError> {
        let source = plain_name("source", source)?;
        let experiment = plain_name("experiment", experiment)?;
        Ok(self.root.join(source).join(format!("{experiment}.csv")))
    }
}

impl RasterProvider for CsvRasterProvider {
    fn load(&self, request: &RasterRequest) -> Result<Raster, DataError> {
        let path = self.path_for(&request.source, &request.experiment)?;
        if !path.is_file() {
            return Err(DataError::NotFound {
                source_name: request.source.clone(),
                experiment: request.experiment.clone(),
                path,
            });
        }

        let table = load_spike_csv(&path)?;
        if !table.row_errors.is_empty() {
            tracing::warn!(
                path = %path.display(),
                skipped = table.row_errors.len(),
                rows = table.rows_read,
                first_error = %table.row_errors[0].message,
                "skipped invalid spike rows"
            );
        }

        let real = Raster::from_spikes(
            RasterRequest {
                surrogate: crate::domain::Surrogate::Real,
                ..request.clone()
            },
            table.n_units,
            &table.spikes,
            table.duration_ms + 1.0,
        );
        with_surrogate(real, request)
    }

    fn experiments(&self, source: &str) -> Result<Vec<String>, DataError> {
        list_csv_stems(&self.root.join(plain_name("source", source)?))
    }
}

/// A single path segment: no separators, not `.` or `..`, no NUL.
fn plain_name<'a>(field: &'static str, value: &'a str) -> Result<&'a str, DataError> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']);
    if bad {
        return Err(DataError::InvalidName {
            field,
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// Re-tag a real raster for `request`, applying its surrogate scheme.
pub fn with_surrogate(real: Raster, request: &RasterRequest) -> Result<Raster, DataError> {
    if request.surrogate.is_real() {
        return Ok(Raster::from_counts(request.clone(), real.counts().clone()));
    }
    let counts = surrogate::apply(&request.surrogate, real.counts().clone(), request.seed())?;
    Ok(Raster::from_counts(request.clone(), counts))
}

fn list_csv_stems(dir: &Path) -> Result<Vec<String>, DataError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(DataError::Io {
                path: dir.to_path_buf(),
                source: e,
            });
        }
    };

    let mut out: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv")))
        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    out.sort();
    Ok(out)
}

/// Experiments of `source` whose names match a `*`/`?` glob.
pub fn select_experiments(
    provider: &dyn RasterProvider,
    source: &str,
    pattern: &str,
) -> Result<Vec<String>, DataError> {
    Ok(provider
        .experiments(source)?
        .into_iter()
        .filter(|name| glob_match(pattern, name))
        .collect())
}

/// Shell-style wildcard match supporting `*` (any run) and `?` (one char).
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = name.chars().collect();
    let (mut pi, mut si) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while si < s.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == s[si]) {
            pi += 1;
            si += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, si));
            pi += 1;
        } else if let Some((star_pi, star_si)) = star {
            // Let the last `*` absorb one more character and retry.
            pi = star_pi + 1;
            si = star_si + 1;
            star = Some((star_pi, star_si + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Surrogate;

    #[test]
    fn glob_semantics() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("e?", "e1"));
        assert!(!glob_match("e?", "e12"));
        assert!(glob_match("org*_b", "org_a_b"));
        assert!(!glob_match("org*_b", "org_a_c"));
        assert!(glob_match("", ""));
        assert!(!glob_match("", "x"));
    }

    #[test]
    fn loads_csv_and_lists_experiments() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("A");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("e1.csv"), "unit,time_ms\n0,5\n1,25\n1,26\n").unwrap();
        std::fs::write(src.join("e2.csv"), "unit,time_ms\n0,5\n").unwrap();
        std::fs::write(src.join("notes.txt"), "ignored").unwrap();

        let provider = CsvRasterProvider::new(dir.path());
        assert_eq!(provider.experiments("A").unwrap(), vec!["e1", "e2"]);
        assert!(provider.experiments("missing").unwrap().is_empty());
        assert_eq!(
            select_experiments(&provider, "A", "*1").unwrap(),
            vec!["e1".to_string()]
        );

        let request = RasterRequest {
            source: "A".into(),
            experiment: "e1".into(),
            bin_size_ms: 10,
            surrogate: Surrogate::Real,
        };
        let raster = provider.load(&request).unwrap();
        assert_eq!(raster.n_units(), 2);
        assert_eq!(raster.counts()[(2, 1)], 2.0);
        assert_eq!(raster.request(), &request);

        let shuffled = provider
            .load(&RasterRequest {
                surrogate: Surrogate::parse("shuffle"),
                ..request.clone()
            })
            .unwrap();
        assert_eq!(shuffled.total_spikes(), raster.total_spikes());
        assert_ne!(shuffled.id(), raster.id());
    }

    #[test]
    fn names_cannot_escape_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(dir.path().join("x.csv"), "unit,time_ms\n0,5\n").unwrap();

        let provider = CsvRasterProvider::new(&data);
        for (source, experiment) in [("A", "../x"), ("..", "x"), ("A", "a\\b"), ("A", "..")] {
            let err = provider
                .load(&RasterRequest {
                    source: source.into(),
                    experiment: experiment.into(),
                    bin_size_ms: 10,
                    surrogate: Surrogate::Real,
                })
                .unwrap_err();
            assert!(matches!(err, DataError::InvalidName { .. }), "{source}/{experiment}");
        }
        assert!(matches!(provider.experiments(".."), Err(DataError::InvalidName { .. })));
        assert!(provider.path_for("A", "e.1").is_ok());
    }

    #[test]
    fn missing_experiment_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CsvRasterProvider::new(dir.path());
        let err = provider
            .load(&RasterRequest {
                source: "A".into(),
                experiment: "nope".into(),
                bin_size_ms: 10,
                surrogate: Surrogate::Real,
            })
            .unwrap_err();
        assert!(matches!(err, DataError::NotFound { .. }));
    }
}
