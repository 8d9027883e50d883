//! Filesystem model cache: one pretty-printed JSON artifact per key.
//!
//! Layout:
//!
//! ```text
//! <root>/
//!   .tmp/                                   in-flight writes
//!   <source>/<exp>_<bin>ms_K<n>_<surr>_<lib>.json
//! ```
//!
//! Several worker processes may share one root. Stores for different keys
//! touch different paths; racing stores for the same key are resolved by the
//! no-clobber publish (exactly one wins, the rest see `AlreadyExists`).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cache::{ModelCache, check_key};
use crate::domain::{FittedModel, ModelKey};
use crate::error::StoreError;
use crate::io::json::{JsonFileError, Publish, read_json, write_json_atomic};

const TMP_DIR: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct FsModelCache {
    root: PathBuf,
}

/// Just enough of an artifact to list it.
#[derive(Deserialize)]
struct ArtifactHeader {
    key: ModelKey,
}

impl FsModelCache {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let tmp = root.join(TMP_DIR);
        fs::create_dir_all(&tmp).map_err(|e| io_error(&tmp, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the artifact for `key` lives.
    pub fn path_for(&self, key: &ModelKey) -> PathBuf {
        self.root.join(key.storage_path())
    }

    fn collect_artifacts(&self, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error(dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_error(dir, e))?;
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let file_type = entry.file_type().map_err(|e| io_error(&path, e))?;
            if file_type.is_dir() {
                self.collect_artifacts(&path, out)?;
            } else if path.extension().is_some_and(|ext| ext == "json") {
                out.push(path);
            }
        }
        Ok(())
    }
}

impl ModelCache for FsModelCache {
    fn lookup(&self, key: &ModelKey) -> Result<Option<FittedModel>, StoreError> {
        let path = self.path_for(key);
        let Some(model) = read_json::<FittedModel>(&path).map_err(|e| json_error(&path, e))? else {
            return Ok(None);
        };
        if &model.key != key {
            return Err(StoreError::KeyMismatch {
                expected: key.clone(),
                found: model.key,
            });
        }
        Ok(Some(model))
    }

    fn store(&self, key: &ModelKey, model: &FittedModel, overwrite: bool) -> Result<(), StoreError> {
        check_key(key, model)?;
        let target = self.path_for(key);
        let tmp_dir = self.root.join(TMP_DIR);

        if overwrite {
            let existed = target.is_file();
            write_json_atomic(&tmp_dir, &target, model, true, Publish::Replace)
                .map_err(|e| json_error(&target, e))?;
            if existed {
                tracing::warn!(key = %key, path = %target.display(), "overwrote cached model");
            }
            return Ok(());
        }

        match write_json_atomic(&tmp_dir, &target, model, true, Publish::NoClobber) {
            Ok(()) => Ok(()),
            Err(JsonFileError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(StoreError::AlreadyExists(key.clone()))
            }
            Err(e) => Err(json_error(&target, e)),
        }
    }

    fn exists(&self, key: &ModelKey) -> Result<bool, StoreError> {
        let path = self.path_for(key);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    fn keys(&self) -> Result<Vec<ModelKey>, StoreError> {
        let mut paths = Vec::new();
        self.collect_artifacts(&self.root, &mut paths)?;
        paths.sort();

        let mut keys = Vec::with_capacity(paths.len());
        for path in paths {
            match read_json::<ArtifactHeader>(&path) {
                Ok(Some(header)) => keys.push(header.key),
                // Removed between listing and reading.
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable cache entry");
                }
            }
        }
        Ok(keys)
    }
}

fn io_error(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn json_error(path: &Path, e: JsonFileError) -> StoreError {
    match e {
        JsonFileError::Io(source) => io_error(path, source),
        JsonFileError::Parse(err) => StoreError::Corrupt {
            path: path.to_path_buf(),
            message: err.to_string(),
        },
    }
}
