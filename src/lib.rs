//! `hmm-cache` library crate.
//!
//! Fitted hidden Markov models for spike-raster analysis, cached by their
//! parameters and computed either in-process or by worker processes pulling
//! from a shared job queue.
//!
//! The binary (`hmmc`) is a thin wrapper around this library so that:
//!
//! - the cache, queue and worker are testable without spawning processes
//! - analysis code can use [`handle::ModelHandle`] directly

pub mod app;
pub mod cache;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod handle;
pub mod io;
pub mod math;
pub mod models;
pub mod queue;
pub mod report;
pub mod worker;

#[cfg(test)]
mod testutil;
