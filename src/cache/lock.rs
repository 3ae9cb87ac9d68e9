//! Advisory File Locks
//!
//! Cache entries are shared with other processes, including external
//! cache-maintenance tools, so in-use entries are marked with `flock`
//! style advisory locks. Acquisition blocks; contention serializes access
//! and is never an error. Locks are released when the guard drops.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::{debug, warn};

use crate::error::{Result, RunError};

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Readers of an entry
    Shared,
    /// The writer of an entry
    Exclusive,
}

/// A held advisory lock.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl FileLock {
    /// Opens (creating if needed) `path` and blocks until the lock is held.
    pub fn acquire(path: &Path, mode: LockMode) -> Result<Self> {
        let file = if mode == LockMode::Shared && path.exists() {
            File::open(path).map_err(|e| RunError::io(path, e))?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| RunError::io(parent, e))?;
            }
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)
                .map_err(|e| RunError::io(path, e))?
        };

        match mode {
            LockMode::Shared => FileExt::lock_shared(&file),
            LockMode::Exclusive => FileExt::lock_exclusive(&file),
        }
        .map_err(|e| RunError::io(path, e))?;

        debug!("Acquired {:?} lock on {}", mode, path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
            mode,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}
