//! Call Cache Storage
//!
//! Call cache entries are persisted through the [`CacheStorage`] capability
//! trait. The built-in `json_dir` backend keeps one JSON file per entry;
//! other backends are supplied through a [`StorageRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use rand::Rng;

use super::call::CallCacheEntry;
use crate::config::CallCacheConfig;
use crate::error::{Result, RunError};

/// Lookup/store/invalidate contract of a call cache backend.
pub trait CacheStorage: Send + Sync {
    fn name(&self) -> &str;

    /// Loads the entry for `key`; a missing entry is `Ok(None)`.
    fn load(&self, task: &str, key: &str) -> Result<Option<CallCacheEntry>>;

    /// Stores `entry`, replacing any previous entry with the same key.
    fn store(&self, entry: &CallCacheEntry) -> Result<()>;

    /// Removes the entry for `key` if present.
    fn invalidate(&self, task: &str, key: &str) -> Result<()>;
}

/// `<dir>/<task>/<key>.json`
#[derive(Debug, Clone)]
pub struct JsonDirStorage {
    dir: PathBuf,
}

impl JsonDirStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn entry_path(&self, task: &str, key: &str) -> PathBuf {
        let task: String = task
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(task).join(format!("{}.json", key))
    }
}

impl CacheStorage for JsonDirStorage {
    fn name(&self) -> &str {
        "json_dir"
    }

    fn load(&self, task: &str, key: &str) -> Result<Option<CallCacheEntry>> {
        let path = self.entry_path(task, key);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RunError::io(&path, e)),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn store(&self, entry: &CallCacheEntry) -> Result<()> {
        let path = self.entry_path(&entry.task, &entry.key);
        let parent = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent).map_err(|e| RunError::io(parent, e))?;

        // atomic replace
        let suffix: u32 = rand::thread_rng().gen();
        let tmp = path.with_extension(format!("json.{}.{:08x}.tmp", std::process::id(), suffix));
        fs::write(&tmp, serde_json::to_string_pretty(entry)?).map_err(|e| RunError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| RunError::io(&path, e))?;

        debug!("Wrote call cache entry {}", path.display());
        Ok(())
    }

    fn invalidate(&self, task: &str, key: &str) -> Result<()> {
        let path = self.entry_path(task, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RunError::io(&path, e)),
        }
    }
}

/// Constructor of an externally supplied storage backend.
pub type StorageFactory = Box<dyn Fn(&CallCacheConfig) -> Result<Arc<dyn CacheStorage>> + Send + Sync>;

/// Storage backends by name; `json_dir` is always available.
#[derive(Default)]
pub struct StorageRegistry {
    factories: HashMap<String, StorageFactory>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: StorageFactory) -> Result<()> {
        let name = name.into();
        if name == "json_dir" {
            return Err(RunError::Config(
                "call cache backend 'json_dir' is built in and cannot be replaced".to_string(),
            ));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn build(&self, cfg: &CallCacheConfig) -> Result<Arc<dyn CacheStorage>> {
        if cfg.backend == "json_dir" {
            return Ok(Arc::new(JsonDirStorage::new(&cfg.dir)));
        }
        let factory = self.factories.get(&cfg.backend).ok_or_else(|| {
            RunError::Config(format!("unknown call cache backend '{}'", cfg.backend))
        })?;
        info!("Using registered call cache backend: {}", cfg.backend);
        factory(cfg)
    }
}

impl fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageRegistry")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn entry(key: &str) -> CallCacheEntry {
        CallCacheEntry {
            key: key.to_string(),
            task: "align reads".to_string(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            files: Vec::new(),
        }
    }

    #[test]
    fn test_json_dir_store_load_invalidate() {
        let temp = tempdir().unwrap();
        let storage = JsonDirStorage::new(temp.path());

        assert!(storage.load("align reads", "abc").unwrap().is_none());
        storage.store(&entry("abc")).unwrap();
        assert!(temp.path().join("align_reads/abc.json").exists());
        assert_eq!(storage.load("align reads", "abc").unwrap(), Some(entry("abc")));

        storage.invalidate("align reads", "abc").unwrap();
        assert!(storage.load("align reads", "abc").unwrap().is_none());
        // invalidating twice is fine
        storage.invalidate("align reads", "abc").unwrap();
    }

    #[test]
    fn test_concurrent_stores_of_same_key() {
        let temp = tempdir().unwrap();
        let storage = JsonDirStorage::new(temp.path());

        std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| storage.store(&entry("abc")))).collect();
            for handle in handles {
                handle.join().unwrap().unwrap();
            }
        });

        assert_eq!(storage.load("align reads", "abc").unwrap(), Some(entry("abc")));
        let leftovers: Vec<_> = fs::read_dir(temp.path().join("align_reads"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_corrupt_entry_is_error() {
        let temp = tempdir().unwrap();
        let storage = JsonDirStorage::new(temp.path());
        let path = storage.entry_path("t", "k");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(storage.load("t", "k"), Err(RunError::Json(_))));
    }

    #[derive(Default)]
    struct MemoryStorage {
        entries: Mutex<HashMap<String, CallCacheEntry>>,
    }

    impl CacheStorage for MemoryStorage {
        fn name(&self) -> &str {
            "memory"
        }

        fn load(&self, _task: &str, key: &str) -> Result<Option<CallCacheEntry>> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        fn store(&self, entry: &CallCacheEntry) -> Result<()> {
            self.entries.lock().unwrap().insert(entry.key.clone(), entry.clone());
            Ok(())
        }

        fn invalidate(&self, _task: &str, key: &str) -> Result<()> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }
    }

    #[test]
    fn test_registry() {
        let mut registry = StorageRegistry::new();
        let cfg = CallCacheConfig::default();
        assert_eq!(registry.build(&cfg).unwrap().name(), "json_dir");

        assert!(registry
            .register("json_dir", Box::new(|_| Ok(Arc::new(MemoryStorage::default()) as Arc<dyn CacheStorage>)))
            .is_err());
        registry
            .register("memory", Box::new(|_| Ok(Arc::new(MemoryStorage::default()) as Arc<dyn CacheStorage>)))
            .unwrap();

        let cfg = CallCacheConfig {
            backend: "memory".to_string(),
            ..CallCacheConfig::default()
        };
        let storage = registry.build(&cfg).unwrap();
        storage.store(&entry("k1")).unwrap();
        assert!(storage.load("x", "k1").unwrap().is_some());

        let cfg = CallCacheConfig {
            backend: "redis".to_string(),
            ..CallCacheConfig::default()
        };
        assert!(matches!(registry.build(&cfg), Err(RunError::Config(_))));
    }
}
