//! Persistent store of fitted models, addressed by [`ModelKey`].
//!
//! The cache is the single source of truth for "has this model been fit".
//! Entries are never silently replaced: `store` without `overwrite` fails with
//! [`StoreError::AlreadyExists`] when the key is present.

pub mod fs;
pub mod memory;

pub use fs::FsModelCache;
pub use memory::MemoryModelCache;

use crate::domain::{FittedModel, ModelKey};
use crate::error::StoreError;

pub trait ModelCache: Send + Sync {
    /// The cached model for `key`, if any. Never computes anything.
    fn lookup(&self, key: &ModelKey) -> Result<Option<FittedModel>, StoreError>;

    /// Persist `model` under `key`.
    ///
    /// Fails with `AlreadyExists` when an entry is present and `overwrite` is
    /// false, and with `KeyMismatch` when `model.key != key`.
    fn store(&self, key: &ModelKey, model: &FittedModel, overwrite: bool) -> Result<(), StoreError>;

    fn exists(&self, key: &ModelKey) -> Result<bool, StoreError>;

    /// Every cached key, sorted by storage path.
    fn keys(&self) -> Result<Vec<ModelKey>, StoreError>;
}

fn check_key(key: &ModelKey, model: &FittedModel) -> Result<(), StoreError> {
    if &model.key != key {
        return Err(StoreError::KeyMismatch {
            expected: key.clone(),
            found: model.key.clone(),
        });
    }
    Ok(())
}
