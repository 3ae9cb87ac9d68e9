//! Call Cache
//!
//! Memoizes a task's outputs keyed by a SHA-256 over its identity and
//! input values. Each entry records the modification time of every local
//! file its inputs and outputs reference; a lookup re-checks them and
//! treats any change or missing path as a miss, deleting the stale entry.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use super::storage::CacheStorage;
use crate::config::CallCacheConfig;
use crate::error::{Result, RunError};
use crate::workflow::value::is_uri;
use crate::workflow::{Task, Value};

/// Modification time of one referenced path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    pub path: PathBuf,
    pub mtime_secs: u64,
    pub mtime_nanos: u32,
}

impl FileStamp {
    /// Stamps `path` as it is now; `None` if it does not exist.
    pub fn of(path: &Path) -> Option<Self> {
        let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
        let since = modified.duration_since(UNIX_EPOCH).ok()?;
        Some(Self {
            path: path.to_path_buf(),
            mtime_secs: since.as_secs(),
            mtime_nanos: since.subsec_nanos(),
        })
    }

    /// Whether the path still exists with the recorded modification time.
    pub fn is_current(&self) -> bool {
        FileStamp::of(&self.path).as_ref() == Some(self)
    }
}

/// A persisted call cache record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallCacheEntry {
    pub key: String,
    pub task: String,
    pub inputs: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, Value>,
    pub files: Vec<FileStamp>,
}

impl CallCacheEntry {
    /// The first referenced path that changed or vanished, if any.
    pub fn stale_path(&self) -> Option<&Path> {
        self.files
            .iter()
            .find(|stamp| !stamp.is_current())
            .map(|stamp| stamp.path.as_path())
    }
}

/// Hex SHA-256 over the canonical JSON of task identity and inputs.
///
/// Maps serialize with sorted keys, so the key does not depend on
/// insertion order; `Int(1)`, `Float(1.0)` and `String("1")` hash apart.
pub fn call_key(task: &Task, inputs: &BTreeMap<String, Value>) -> Result<String> {
    let canonical = json!({
        "task": task.identity(),
        "inputs": serde_json::to_value(inputs)?,
    });
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Stamps every local file and directory referenced by `values`,
/// descending into directories.
pub fn stamp_files<'a, I>(values: I) -> Result<Vec<FileStamp>>
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut stamps = Vec::new();
    for value in values {
        for (path, _) in value.file_refs() {
            if is_uri(path) {
                continue;
            }
            stamp_tree(Path::new(path), &mut stamps)?;
        }
    }
    stamps.sort_by(|a, b| a.path.cmp(&b.path));
    stamps.dedup();
    Ok(stamps)
}

fn stamp_tree(path: &Path, stamps: &mut Vec<FileStamp>) -> Result<()> {
    let stamp = FileStamp::of(path).ok_or_else(|| {
        RunError::io(path, std::io::Error::new(std::io::ErrorKind::NotFound, "referenced path missing"))
    })?;
    stamps.push(stamp);

    if path.is_dir() {
        for entry in fs::read_dir(path).map_err(|e| RunError::io(path, e))? {
            let entry = entry.map_err(|e| RunError::io(path, e))?;
            stamp_tree(&entry.path(), stamps)?;
        }
    }
    Ok(())
}

/// Lookup and store through a [`CacheStorage`] backend.
pub struct CallCache {
    cfg: CallCacheConfig,
    storage: Arc<dyn CacheStorage>,
}

impl CallCache {
    pub fn new(cfg: &CallCacheConfig, storage: Arc<dyn CacheStorage>) -> Self {
        Self {
            cfg: cfg.clone(),
            storage,
        }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.get || self.cfg.put
    }

    /// Returns a valid cached entry, or `None`.
    ///
    /// Stale, corrupt or unreadable entries are misses; stale and corrupt
    /// ones are removed.
    pub fn lookup(&self, task: &Task, inputs: &BTreeMap<String, Value>) -> Option<CallCacheEntry> {
        if !self.cfg.get {
            return None;
        }
        let key = match call_key(task, inputs) {
            Ok(key) => key,
            Err(e) => {
                warn!("[{}] cannot derive call cache key: {}", task.name, e);
                return None;
            }
        };

        let entry = match self.storage.load(&task.name, &key) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!("[{}] call cache miss {}", task.name, key);
                return None;
            }
            Err(RunError::Json(e)) => {
                info!("[{}] discarding unreadable call cache entry {}: {}", task.name, key, e);
                self.invalidate(&task.name, &key);
                return None;
            }
            Err(e) => {
                warn!("[{}] call cache lookup failed: {}", task.name, e);
                return None;
            }
        };

        if let Some(path) = entry.stale_path() {
            info!(
                "[{}] call cache entry {} invalidated: {} changed or is missing",
                task.name,
                key,
                path.display()
            );
            self.invalidate(&task.name, &key);
            return None;
        }

        info!("[{}] call cache hit {}", task.name, key);
        Some(entry)
    }

    /// Records `outputs` for `task` run with `inputs`.
    pub fn store(
        &self,
        task: &Task,
        inputs: &BTreeMap<String, Value>,
        outputs: &BTreeMap<String, Value>,
    ) -> Result<Option<String>> {
        if !self.cfg.put {
            return Ok(None);
        }
        let key = call_key(task, inputs)?;
        let files = stamp_files(inputs.values().chain(outputs.values()))?;
        let entry = CallCacheEntry {
            key: key.clone(),
            task: task.name.clone(),
            inputs: inputs.clone(),
            outputs: outputs.clone(),
            files,
        };
        self.storage.store(&entry)?;
        info!("[{}] stored call cache entry {}", task.name, key);
        Ok(Some(key))
    }

    fn invalidate(&self, task: &str, key: &str) {
        if let Err(e) = self.storage.invalidate(task, key) {
            warn!("[{}] failed to remove call cache entry {}: {}", task, key, e);
        }
    }
}

impl std::fmt::Debug for CallCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCache")
            .field("get", &self.cfg.get)
            .field("put", &self.cfg.put)
            .field("storage", &self.storage.name())
            .finish()
    }
}
