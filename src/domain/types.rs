//! Shared domain types.
//!
//! These types are intentionally kept small and serializable so they can be:
//!
//! - used as cache/job identities across independent processes
//! - persisted as JSON artifacts and job files
//! - reloaded later for analysis and reporting

use std::fmt;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::models::PoissonHmm;

/// Which fitting backend produced (or should produce) a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Library {
    /// Baum–Welch EM over posterior state probabilities.
    Default,
    /// Hard-assignment EM: Viterbi decoding followed by count re-estimation.
    Viterbi,
}

impl Library {
    pub fn as_str(self) -> &'static str {
        match self {
            Library::Default => "default",
            Library::Viterbi => "viterbi",
        }
    }
}

impl fmt::Display for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Real data or a named surrogate (shuffle) scheme.
///
/// The name `real` always parses to [`Surrogate::Real`], so there is exactly one
/// spelling for the unshuffled raster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Surrogate {
    Real,
    Named(String),
}

impl Surrogate {
    pub fn parse(name: &str) -> Self {
        let name = name.trim();
        if name.eq_ignore_ascii_case("real") {
            Surrogate::Real
        } else {
            Surrogate::Named(name.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Surrogate::Real => "real",
            Surrogate::Named(name) => name,
        }
    }

    pub fn is_real(&self) -> bool {
        matches!(self, Surrogate::Real)
    }
}

impl From<String> for Surrogate {
    fn from(value: String) -> Self {
        Surrogate::parse(&value)
    }
}

impl From<Surrogate> for String {
    fn from(value: Surrogate) -> Self {
        value.as_str().to_string()
    }
}

impl std::str::FromStr for Surrogate {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Surrogate::parse(s))
    }
}

impl fmt::Display for Surrogate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason a [`ModelKey`] could not be constructed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("source name must not be empty")]
    EmptySource,
    #[error("experiment name must not be empty")]
    EmptyExperiment,
    #[error("surrogate name must not be empty")]
    EmptySurrogate,
    #[error("bin size must be a positive number of milliseconds")]
    ZeroBinSize,
    #[error("an HMM needs at least 2 hidden states (got {0})")]
    TooFewStates(u32),
}

/// The identity of one fitting task and of its cached result.
///
/// Fields are private: a key is validated once at construction and never
/// changes afterwards. Two keys are equal iff every field is equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ModelKeyRepr", into = "ModelKeyRepr")]
pub struct ModelKey {
    source: String,
    experiment: String,
    bin_size_ms: u32,
    n_states: u32,
    surrogate: Surrogate,
    library: Library,
}

#[derive(Serialize, Deserialize)]
struct ModelKeyRepr {
    source: String,
    experiment: String,
    bin_size_ms: u32,
    n_states: u32,
    surrogate: Surrogate,
    library: Library,
}

impl TryFrom<ModelKeyRepr> for ModelKey {
    type Error = KeyError;

    fn try_from(r: ModelKeyRepr) -> Result<Self, Self::Error> {
        ModelKey::new(r.source, r.experiment, r.bin_size_ms, r.n_states, r.surrogate, r.library)
    }
}

impl From<ModelKey> for ModelKeyRepr {
    fn from(k: ModelKey) -> Self {
        ModelKeyRepr {
            source: k.source,
            experiment: k.experiment,
            bin_size_ms: k.bin_size_ms,
            n_states: k.n_states,
            surrogate: k.surrogate,
            library: k.library,
        }
    }
}

impl ModelKey {
    pub fn new(
        source: impl Into<String>,
        experiment: impl Into<String>,
        bin_size_ms: u32,
        n_states: u32,
        surrogate: Surrogate,
        library: Library,
    ) -> Result<Self, KeyError> {
        let source = source.into();
        let experiment = experiment.into();
        // `Named("real")` and `Named(" x")` must not alias `Real` and `Named("x")`.
        let surrogate = Surrogate::parse(surrogate.as_str());
        if source.is_empty() {
            return Err(KeyError::EmptySource);
        }
        if experiment.is_empty() {
            return Err(KeyError::EmptyExperiment);
        }
        if surrogate.as_str().is_empty() {
            return Err(KeyError::EmptySurrogate);
        }
        if bin_size_ms == 0 {
            return Err(KeyError::ZeroBinSize);
        }
        if n_states < 2 {
            return Err(KeyError::TooFewStates(n_states));
        }
        Ok(Self {
            source,
            experiment,
            bin_size_ms,
            n_states,
            surrogate,
            library,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    pub fn bin_size_ms(&self) -> u32 {
        self.bin_size_ms
    }

    pub fn n_states(&self) -> u32 {
        self.n_states
    }

    pub fn surrogate(&self) -> &Surrogate {
        &self.surrogate
    }

    pub fn library(&self) -> Library {
        self.library
    }

    /// Same key with a different number of hidden states.
    pub fn with_states(&self, n_states: u32) -> Result<Self, KeyError> {
        ModelKey::new(
            self.source.clone(),
            self.experiment.clone(),
            self.bin_size_ms,
            n_states,
            self.surrogate.clone(),
            self.library,
        )
    }

    /// Relative storage path of this key's artifact.
    ///
    /// Layout: `<source>/<experiment>_<bin>ms_K<n>_<surrogate>_<library>.json`.
    ///
    /// Free-text components are percent-escaped (see [`escape_component`]), so the
    /// mapping is injective and computable by any process without a registry.
    pub fn storage_path(&self) -> std::path::PathBuf {
        let file = format!(
            "{}_{}ms_K{}_{}_{}.json",
            escape_component(&self.experiment),
            self.bin_size_ms,
            self.n_states,
            escape_component(self.surrogate.as_str()),
            self.library.as_str(),
        );
        std::path::PathBuf::from(escape_component(&self.source)).join(file)
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} bin={}ms K={} surr={} lib={}",
            self.source, self.experiment, self.bin_size_ms, self.n_states, self.surrogate, self.library
        )
    }
}

/// Escape a free-text key component for use inside a single path segment.
///
/// ASCII alphanumerics, `-` and `.` pass through; every other byte (including the
/// `_` field separator, `/` and `%`) becomes `%XX`. A leading `.` is escaped too,
/// so no component can be `.`/`..` or a hidden file.
pub fn escape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, b) in raw.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric() || b == b'-' || (b == b'.' && i > 0);
        if keep {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// A trained model plus fit metadata.
///
/// Created only by a successful fit; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub key: ModelKey,
    pub hmm: PoissonHmm,
    pub log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Fit attempt (1-based) that produced this artifact.
    pub attempt: u32,
    pub fitted_at: DateTime<Utc>,
}

/// Queue-wide unique job identifier.
///
/// Ids sort roughly by creation time, which gives the filesystem queue an
/// approximately FIFO scan order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        let micros = Utc::now().timestamp_micros().max(0) as u64;
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{micros:016x}-{:08x}-{seq:08x}", std::process::id()))
    }

    pub fn from_file_stem(stem: &str) -> Option<Self> {
        let ok = !stem.is_empty()
            && stem
                .bytes()
                .all(|b| b.is_ascii_hexdigit() || b == b'-');
        ok.then(|| Self(stem.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One pending fitting task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub key: ModelKey,
    pub verbose: bool,
    /// Fit attempts started so far (incremented on every lease).
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub leased_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(key: ModelKey, verbose: bool) -> Self {
        Self {
            id: JobId::generate(),
            key,
            verbose,
            attempts: 0,
            enqueued_at: Utc::now(),
            leased_at: None,
            last_error: None,
        }
    }
}

/// Persistent job states. Succeeded jobs are removed from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Leased,
    Abandoned,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Pending => "pending",
            JobState::Leased => "leased",
            JobState::Abandoned => "abandoned",
        })
    }
}

/// Result of handing a failed job back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// The job is pending again and will be retried.
    Accepted,
    /// The retry budget is spent; the job is abandoned.
    Rejected,
}

/// Bounded-retry policy shared by the queue and the synchronous fit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ModelKey {
        ModelKey::new("A", "e1", 30, 15, Surrogate::Real, Library::Default).unwrap()
    }

    #[test]
    fn storage_path_is_deterministic() {
        assert_eq!(key().storage_path(), key().storage_path());
        assert_eq!(
            key().storage_path(),
            std::path::PathBuf::from("A").join("e1_30ms_K15_real_default.json")
        );
    }

    #[test]
    fn storage_path_differs_per_field() {
        let base = key();
        let variants = [
            ModelKey::new("B", "e1", 30, 15, Surrogate::Real, Library::Default).unwrap(),
            ModelKey::new("A", "e2", 30, 15, Surrogate::Real, Library::Default).unwrap(),
            ModelKey::new("A", "e1", 31, 15, Surrogate::Real, Library::Default).unwrap(),
            ModelKey::new("A", "e1", 30, 16, Surrogate::Real, Library::Default).unwrap(),
            ModelKey::new("A", "e1", 30, 15, Surrogate::parse("shuffle"), Library::Default).unwrap(),
            ModelKey::new("A", "e1", 30, 15, Surrogate::Real, Library::Viterbi).unwrap(),
        ];
        for v in &variants {
            assert_ne!(v.storage_path(), base.storage_path(), "{v}");
        }
    }

    #[test]
    fn separators_inside_fields_do_not_collide() {
        // Without escaping both of these would render as "x_1_30ms...".
        let a = ModelKey::new("s", "x_1", 30, 2, Surrogate::Real, Library::Default).unwrap();
        let b = ModelKey::new("s", "x", 30, 2, Surrogate::parse("1"), Library::Default).unwrap();
        assert_ne!(a.storage_path(), b.storage_path());
    }

    #[test]
    fn escaping_keeps_paths_inside_root() {
        let k = ModelKey::new("..", "../../etc/passwd", 30, 2, Surrogate::Real, Library::Default).unwrap();
        let path = k.storage_path();
        assert_eq!(path.components().count(), 2);
        assert!(!path.to_string_lossy().contains("/../"));
        assert_eq!(escape_component(".."), "%2E.");
    }

    #[test]
    fn key_validation() {
        assert_eq!(
            ModelKey::new("A", "e", 30, 1, Surrogate::Real, Library::Default),
            Err(KeyError::TooFewStates(1))
        );
        assert_eq!(
            ModelKey::new("A", "e", 0, 4, Surrogate::Real, Library::Default),
            Err(KeyError::ZeroBinSize)
        );
        assert_eq!(
            ModelKey::new("", "e", 30, 4, Surrogate::Real, Library::Default),
            Err(KeyError::EmptySource)
        );
    }

    #[test]
    fn key_json_rejects_invalid_fields() {
        let json = serde_json::to_string(&key()).unwrap();
        let back: ModelKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key());

        let bad = json.replace("\"n_states\":15", "\"n_states\":1");
        assert!(serde_json::from_str::<ModelKey>(&bad).is_err());
    }

    #[test]
    fn surrogate_real_has_one_spelling() {
        assert_eq!(Surrogate::parse("REAL"), Surrogate::Real);
        assert_eq!(Surrogate::parse("shuffle").as_str(), "shuffle");
    }

    #[test]
    fn hand_built_surrogate_names_are_normalized() {
        let named = ModelKey::new("A", "e1", 30, 15, Surrogate::Named("REAL".into()), Library::Default).unwrap();
        assert_eq!(named, key());
        assert!(named.surrogate().is_real());

        let padded = ModelKey::new("A", "e1", 30, 15, Surrogate::Named(" shuffle ".into()), Library::Default).unwrap();
        assert_eq!(padded.surrogate(), &Surrogate::Named("shuffle".into()));

        // A key survives its own serialization unchanged.
        let back: ModelKey = serde_json::from_str(&serde_json::to_string(&padded).unwrap()).unwrap();
        assert_eq!(back, padded);
    }

    #[test]
    fn job_ids_are_unique_and_parseable() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert_eq!(JobId::from_file_stem(a.as_str()), Some(a));
        assert_eq!(JobId::from_file_stem("../x"), None);
    }

    #[test]
    fn retry_policy_bounds_attempts() {
        let p = RetryPolicy::new(3);
        assert!(p.allows_retry(1));
        assert!(p.allows_retry(2));
        assert!(!p.allows_retry(3));
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
    }
}
