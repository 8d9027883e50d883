//! In-process model cache.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{PoisonError, RwLock};

use crate::cache::{ModelCache, check_key};
use crate::domain::{FittedModel, ModelKey};
use crate::error::StoreError;

#[derive(Debug, Default)]
pub struct MemoryModelCache {
    entries: RwLock<HashMap<ModelKey, FittedModel>>,
}

impl MemoryModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ModelCache for MemoryModelCache {
    fn lookup(&self, key: &ModelKey) -> Result<Option<FittedModel>, StoreError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn store(&self, key: &ModelKey, model: &FittedModel, overwrite: bool) -> Result<(), StoreError> {
        check_key(key, model)?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                if !overwrite {
                    return Err(StoreError::AlreadyExists(key.clone()));
                }
                tracing::warn!(key = %key, "overwriting cached model");
                slot.insert(model.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(model.clone());
            }
        }
        Ok(())
    }

    fn exists(&self, key: &ModelKey) -> Result<bool, StoreError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.contains_key(key))
    }

    fn keys(&self) -> Result<Vec<ModelKey>, StoreError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<ModelKey> = entries.keys().cloned().collect();
        keys.sort_by_key(|k| k.storage_path());
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{key, model};

    #[test]
    fn store_is_idempotent_without_overwrite() {
        let cache = MemoryModelCache::new();
        let k = key("e1", 15);
        assert!(cache.lookup(&k).unwrap().is_none());

        cache.store(&k, &model(&k, 1), false).unwrap();
        let err = cache.store(&k, &model(&k, 2), false).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(ref e) if e == &k));
        assert_eq!(cache.lookup(&k).unwrap().unwrap().attempt, 1);

        cache.store(&k, &model(&k, 2), true).unwrap();
        assert_eq!(cache.lookup(&k).unwrap().unwrap().attempt, 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn rejects_model_for_another_key() {
        let cache = MemoryModelCache::new();
        let a = key("e1", 15);
        let b = key("e1", 16);
        let err = cache.store(&a, &model(&b, 1), false).unwrap_err();
        assert!(matches!(err, StoreError::KeyMismatch { .. }));
        assert!(!cache.exists(&a).unwrap());
    }

    #[test]
    fn keys_are_listed() {
        let cache = MemoryModelCache::new();
        for k in [key("e2", 10), key("e1", 10)] {
            cache.store(&k, &model(&k, 1), false).unwrap();
        }
        let keys = cache.keys().unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].experiment(), "e1");
    }
}
