// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Crash-safe file writes.

use std::ffi::OsString;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{PolicyError, PolicyResult};

#[cfg(unix)]
fn sync_directory(path: &Path) -> PolicyResult<()> {
    let dir = File::open(path)
        .map_err(|e| PolicyError::PersistenceFailed(format!("open directory failed: {e}")))?;
    dir.sync_all()
        .map_err(|e| PolicyError::PersistenceFailed(format!("sync directory failed: {e}")))
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> PolicyResult<()> {
    Ok(())
}

/// Appends to the full file name so `policy` and `policy.key` stage
/// through different temp files.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes `bytes` to a temp file, fsyncs it, renames it over `path`, and
/// fsyncs the parent directory.
pub fn write_file_atomic_durable(path: &Path, bytes: &[u8]) -> PolicyResult<()> {
    let write_err =
        |e: std::io::Error| PolicyError::PersistenceFailed(format!("{}: {e}", path.display()));
    let parent = path
        .parent()
        .ok_or_else(|| PolicyError::PersistenceFailed("path parent missing".to_string()))?;
    std::fs::create_dir_all(parent).map_err(write_err)?;
    let tmp = temp_path(path);
    let mut f = File::create(&tmp).map_err(write_err)?;
    f.write_all(bytes).map_err(write_err)?;
    f.sync_all().map_err(write_err)?;
    std::fs::rename(&tmp, path).map_err(write_err)?;
    sync_directory(parent)
}

pub fn remove_file_durable(path: &Path) -> PolicyResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(PolicyError::PersistenceFailed(format!(
                "remove {} failed: {e}",
                path.display()
            )))
        }
    }
    let parent = path
        .parent()
        .ok_or_else(|| PolicyError::PersistenceFailed("path parent missing".to_string()))?;
    sync_directory(parent)
}

/// What a snapshot asks the file to become.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotContents {
    Bytes(Vec<u8>),
    Absent,
}

/// One backing file plus the generation of the last snapshot written to it.
///
/// Snapshots may be committed from several blocking tasks at once. The
/// lock orders writes to this file, and a snapshot older than the last one
/// written is dropped so the file always ends at the newest state.
#[derive(Debug)]
pub struct DurableSlot {
    path: PathBuf,
    last_written: Mutex<u64>,
}

impl DurableSlot {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_written: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `Ok(false)` when a newer snapshot already reached disk.
    pub fn commit(&self, generation: u64, contents: &SlotContents) -> PolicyResult<bool> {
        let mut last = self.last_written.lock();
        if generation < *last {
            return Ok(false);
        }
        match contents {
            SlotContents::Bytes(bytes) => write_file_atomic_durable(&self.path, bytes)?,
            SlotContents::Absent => remove_file_durable(&self.path)?,
        }
        *last = generation;
        Ok(true)
    }
}
