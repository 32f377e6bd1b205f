//! Atomic snapshot persistence for flat JSON store files.
//!
//! Protocol (POSIX): write temp, fsync temp, rename temp -> canonical path,
//! fsync directory. A reader therefore always sees either the previous
//! durable snapshot or the new one, never a partial intermediate.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use uuid::Uuid;

/// Errors from atomic snapshot writes.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to serialize snapshot payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("I/O failure during {step} at {path}: {source}")]
    Io {
        step: &'static str,
        path: String,
        source: std::io::Error,
    },
}

impl PersistError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Serialize(_) => "PERSIST_SERIALIZE_FAILED",
            Self::Io { step, .. } => match *step {
                "write_temp" => "PERSIST_WRITE_TEMP_FAILED",
                "fsync_temp" => "PERSIST_FSYNC_TEMP_FAILED",
                "rename" => "PERSIST_RENAME_FAILED",
                "fsync_dir" => "PERSIST_FSYNC_DIR_FAILED",
                _ => "PERSIST_IO_FAILED",
            },
        }
    }
}

fn io_err(step: &'static str, path: &Path, source: std::io::Error) -> PersistError {
    PersistError::Io {
        step,
        path: path.display().to_string(),
        source,
    }
}

/// Atomically replace `path` with the JSON serialization of `value`.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let payload = serde_json::to_vec_pretty(value)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "snapshot.json".to_string());
    let temp_path = dir.join(format!(".{file_name}.tmp.{}", Uuid::now_v7()));

    let mut temp_file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .map_err(|source| io_err("write_temp", &temp_path, source))?;
    temp_file
        .write_all(&payload)
        .map_err(|source| io_err("write_temp", &temp_path, source))?;
    temp_file
        .sync_all()
        .map_err(|source| io_err("fsync_temp", &temp_path, source))?;

    fs::rename(&temp_path, path).map_err(|source| io_err("rename", path, source))?;

    let dir_handle = File::open(dir).map_err(|source| io_err("fsync_dir", dir, source))?;
    dir_handle
        .sync_all()
        .map_err(|source| io_err("fsync_dir", dir, source))?;
    Ok(())
}
