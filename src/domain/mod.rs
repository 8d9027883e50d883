//! Domain types used throughout the crate.
//!
//! This module defines:
//!
//! - the cache/job identity (`ModelKey`, `Surrogate`, `Library`)
//! - fitted artifacts (`FittedModel`)
//! - queue records (`Job`, `JobId`, `JobState`, `RequeueOutcome`)
//! - the shared retry policy (`RetryPolicy`)

pub mod types;

pub use types::*;
