//! Atomic JSON files.
//!
//! Every persisted document (cached models, job files) is written to a unique
//! temp file, fsynced, then published into place in one filesystem operation,
//! so readers only ever see complete documents:
//!
//! - [`Publish::NoClobber`]: `hard_link` (fails with `AlreadyExists` when the
//!   target is present; exactly one of several racing writers wins)
//! - [`Publish::Replace`]: `rename` over the target

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    NoClobber,
    Replace,
}

#[derive(Debug, thiserror::Error)]
pub enum JsonFileError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}

/// Read and parse a JSON file. A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, JsonFileError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value = serde_json::from_reader(io::BufReader::new(file))?;
    Ok(Some(value))
}

/// Serialize `value` into `target` through a temp file in `tmp_dir`.
///
/// With [`Publish::NoClobber`], an existing target yields an
/// `io::ErrorKind::AlreadyExists` error and leaves the target untouched.
pub fn write_json_atomic<T: Serialize>(
    tmp_dir: &Path,
    target: &Path,
    value: &T,
    pretty: bool,
    mode: Publish,
) -> Result<(), JsonFileError> {
    let tmp = write_temp_json(tmp_dir, value, pretty)?;
    publish(&tmp, target, mode)?;
    Ok(())
}

fn write_temp_json<T: Serialize>(tmp_dir: &Path, value: &T, pretty: bool) -> Result<PathBuf, JsonFileError> {
    fs::create_dir_all(tmp_dir)?;
    let tmp = tmp_dir.join(unique_tmp_name());

    let result = (|| -> Result<(), JsonFileError> {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        if pretty {
            serde_json::to_writer_pretty(&mut writer, value)?;
        } else {
            serde_json::to_writer(&mut writer, value)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(tmp)
}

fn publish(tmp: &Path, target: &Path, mode: Publish) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            let _ = fs::remove_file(tmp);
            return Err(e);
        }
    }
    match mode {
        Publish::Replace => fs::rename(tmp, target).inspect_err(|_| {
            let _ = fs::remove_file(tmp);
        }),
        Publish::NoClobber => {
            let linked = fs::hard_link(tmp, target);
            let _ = fs::remove_file(tmp);
            linked
        }
    }
}

/// Process-unique file name for scratch files under a `.tmp/` directory.
pub fn unique_tmp_name() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{nanos:x}-{seq}.tmp", std::process::id())
}
