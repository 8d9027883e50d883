//! Raster data: binning, surrogates, providers and per-experiment metadata.

pub mod metrics;
pub mod provider;
pub mod raster;
pub mod sample;
pub mod surrogate;

pub use metrics::{UnitOrder, load_unit_order};
pub use provider::{CsvRasterProvider, RasterProvider, glob_match, select_experiments};
pub use raster::{BurstOptions, Raster, RasterRequest};
pub use sample::{SyntheticConfig, SyntheticRasterProvider};
