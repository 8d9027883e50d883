//! Input/output helpers.
//!
//! - atomic JSON documents for the cache and queue (`json`)
//! - spike CSV ingest + validation (`ingest`)
//! - CSV exports (`export`)

pub mod export;
pub mod ingest;
pub mod json;

pub use export::*;
pub use ingest::*;
