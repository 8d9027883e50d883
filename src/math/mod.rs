//! Mathematical utilities: log-space arithmetic and entropy.

pub mod entropy;
pub mod logspace;

pub use entropy::*;
pub use logspace::*;
