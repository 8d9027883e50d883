//! Model fitting.
//!
//! Responsibilities:
//!
//! - train a Poisson HMM from a raster (soft or hard EM)
//! - classify failures as transient (retry) or fatal
//! - retry transient failures locally for the synchronous path

pub mod fitter;
pub mod retry;

pub use fitter::*;
pub use retry::*;
