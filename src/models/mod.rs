//! Poisson HMM evaluation and the statistics derived from a fitted model.
//!
//! Everything here is pure: fitting lives in `fit`, persistence in `cache`.

pub mod entropy;
pub mod hmm;

pub use entropy::*;
pub use hmm::*;
