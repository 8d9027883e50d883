//! Error types.
//!
//! Library code returns one `thiserror` enum per concern so callers can match on
//! the failure class (the worker's retry decision depends on it). The binary
//! boundary collapses everything into [`AppError`], which carries the process
//! exit code:
//!
//! - `2`: usage, configuration or input problems
//! - `3`: insufficient data or models unavailable
//! - `4`: runtime / I/O failures

use std::path::PathBuf;

use crate::domain::{JobId, KeyError, ModelKey};

#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

/// Failure of a single fit attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FitError {
    /// The optimizer hit a degenerate step (e.g. a zero-probability quantity in a
    /// ratio). Transient: a fresh random initialization usually succeeds.
    #[error("numerical failure: {0}")]
    Numerical(String),
    /// The inputs can never be fit; retrying would fail the same way.
    #[error("invalid fit input: {0}")]
    InvalidInput(String),
}

impl FitError {
    /// Only numerical failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, FitError::Numerical(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("a fitted model is already cached for {0}")]
    AlreadyExists(ModelKey),
    #[error("artifact key {found} does not match requested key {expected}")]
    KeyMismatch { expected: ModelKey, found: ModelKey },
    #[error("cache I/O error at '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt cache entry '{}': {message}", .path.display())]
    Corrupt { path: PathBuf, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue I/O error at '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt job file '{}': {message}", .path.display())]
    Corrupt { path: PathBuf, message: String },
    #[error("job {0} is not leased or does not exist")]
    UnknownJob(JobId),
}

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("no raster for {source_name}/{experiment} at '{}'", .path.display())]
    NotFound {
        source_name: String,
        experiment: String,
        path: PathBuf,
    },
    #[error("raster I/O error at '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse '{}': {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("raster {0} has no usable spikes")]
    Empty(String),
    #[error("unknown surrogate scheme '{0}' (known: real, shuffle, circshift)")]
    UnknownSurrogate(String),
    #[error("{field} name '{value}' is not a plain file name")]
    InvalidName { field: &'static str, value: String },
}

/// Failure of the synchronous compute-if-missing path.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("gave up on {key} after {attempts} attempts: {last}")]
    Exhausted {
        key: ModelKey,
        attempts: u32,
        last: FitError,
    },
    #[error("fit of {key} failed: {source}")]
    Fit {
        key: ModelKey,
        #[source]
        source: FitError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Data(#[from] DataError),
}

impl From<KeyError> for AppError {
    fn from(e: KeyError) -> Self {
        AppError::new(2, format!("Invalid model key: {e}"))
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::new(4, e.to_string())
    }
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        AppError::new(4, e.to_string())
    }
}

impl From<DataError> for AppError {
    fn from(e: DataError) -> Self {
        let code = match &e {
            DataError::NotFound { .. }
            | DataError::UnknownSurrogate(_)
            | DataError::Parse { .. }
            | DataError::InvalidName { .. } => 2,
            DataError::Empty(_) => 3,
            DataError::Io { .. } => 4,
        };
        AppError::new(code, e.to_string())
    }
}

impl From<ComputeError> for AppError {
    fn from(e: ComputeError) -> Self {
        match e {
            ComputeError::Data(d) => d.into(),
            ComputeError::Store(s) => s.into(),
            other => AppError::new(3, other.to_string()),
        }
    }
}
