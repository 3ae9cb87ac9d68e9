//! Download Cache
//!
//! Stores URI-fetched inputs on disk keyed by the normalized URI:
//!
//! ```text
//! <dir>/files/<scheme>/<host>/<path>     downloaded files
//! <dir>/dirs/<scheme>/<host>/<path>      downloaded directories
//! ```
//!
//! Entries in use hold a shared advisory lock; writers hold an exclusive
//! lock on a `.download.lock` sidecar, so an external maintenance tool can
//! tell which entries are busy. A URI is cacheable when it matches an
//! enable pattern and no disable pattern.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use glob::Pattern;
use log::{debug, info, warn};

use super::downloader::DownloaderRegistry;
use super::lock::{FileLock, LockMode};
use crate::config::DownloadCacheConfig;
use crate::error::{Result, RunError};

/// A URI resolved to a local path.
///
/// Keeps the shared lock on a cache entry for as long as it lives.
#[derive(Debug)]
pub struct Localized {
    pub uri: String,
    pub path: PathBuf,
    pub from_cache: bool,
    _lock: Option<FileLock>,
}

#[derive(Debug)]
pub struct DownloadCache {
    cfg: DownloadCacheConfig,
    enable: Vec<Pattern>,
    disable: Vec<Pattern>,
    downloaders: DownloaderRegistry,
    scratch_seq: AtomicUsize,
}

impl DownloadCache {
    pub fn new(cfg: &DownloadCacheConfig) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Pattern>> {
            patterns
                .iter()
                .map(|p| {
                    Pattern::new(p).map_err(|e| {
                        RunError::Config(format!("invalid download cache pattern '{}': {}", p, e))
                    })
                })
                .collect()
        };

        Ok(Self {
            enable: compile(&cfg.enable_patterns)?,
            disable: compile(&cfg.disable_patterns)?,
            downloaders: DownloaderRegistry::new(cfg.downloader.clone()),
            cfg: cfg.clone(),
            scratch_seq: AtomicUsize::new(0),
        })
    }

    pub fn downloaders_mut(&mut self) -> &mut DownloaderRegistry {
        &mut self.downloaders
    }

    /// Whether `uri` passes the enable/disable patterns. Deny wins.
    pub fn eligible(&self, uri: &str) -> bool {
        self.enable.iter().any(|p| p.matches(uri)) && !self.disable.iter().any(|p| p.matches(uri))
    }

    /// Location of the cache entry for `uri`, or `None` if it is not cacheable.
    pub fn entry_path(&self, uri: &str, directory: bool) -> Option<PathBuf> {
        let (scheme, rest) = uri.split_once("://")?;
        let rest = match rest.split_once('?') {
            Some(_) if !self.cfg.ignore_query => return None,
            Some((without, _)) => without,
            None => rest,
        };
        let rest = rest.split('#').next().unwrap_or_default();
        let key = format!("{}://{}", scheme, rest);
        if !self.eligible(&key) {
            return None;
        }

        let mut path = self
            .cfg
            .dir
            .join(if directory { "dirs" } else { "files" })
            .join(scheme.to_ascii_lowercase());
        let mut segments = 0;
        for segment in rest.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return None;
            }
            path.push(segment);
            segments += 1;
        }
        if segments == 0 {
            return None;
        }
        Some(path)
    }

    /// Returns the cached entry for `uri` when `get` is on and it exists.
    pub fn lookup(&self, uri: &str, directory: bool) -> Result<Option<Localized>> {
        if !self.cfg.get {
            return Ok(None);
        }
        let Some(entry) = self.entry_path(uri, directory) else {
            return Ok(None);
        };
        if !entry.exists() {
            debug!("Download cache miss: {}", uri);
            return Ok(None);
        }

        let lock = FileLock::acquire(&entry, LockMode::Shared)?;
        // removed while we waited for the lock
        if !entry.exists() {
            return Ok(None);
        }
        info!("Download cache hit: {} -> {}", uri, entry.display());
        Ok(Some(Localized {
            uri: uri.to_string(),
            path: entry,
            from_cache: true,
            _lock: Some(lock),
        }))
    }

    /// Downloads `uri`, storing it in the cache when `put` is on and the URI
    /// is cacheable, otherwise into a fresh directory under `scratch`.
    pub fn fetch(&self, uri: &str, directory: bool, scratch: &Path) -> Result<Localized> {
        if self.cfg.put {
            if let Some(entry) = self.entry_path(uri, directory) {
                return self.fetch_into_cache(uri, directory, entry);
            }
            debug!("Not caching {}: excluded by download cache patterns", uri);
        }

        let seq = self.scratch_seq.fetch_add(1, Ordering::SeqCst);
        let dest = scratch.join(seq.to_string()).join(basename(uri));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| RunError::io(parent, e))?;
        }
        self.downloaders.for_uri(uri).fetch(uri, &dest, directory)?;
        Ok(Localized {
            uri: uri.to_string(),
            path: dest,
            from_cache: false,
            _lock: None,
        })
    }

    /// `lookup`, falling back to `fetch`.
    pub fn resolve(&self, uri: &str, directory: bool, scratch: &Path) -> Result<Localized> {
        match self.lookup(uri, directory)? {
            Some(hit) => Ok(hit),
            None => self.fetch(uri, directory, scratch),
        }
    }

    fn fetch_into_cache(&self, uri: &str, directory: bool, entry: PathBuf) -> Result<Localized> {
        let sidecar = sibling(&entry, ".download.lock");
        let writer = FileLock::acquire(&sidecar, LockMode::Exclusive)?;

        if entry.exists() {
            if self.cfg.get {
                // another writer stored it while we waited
                drop(writer);
                if let Some(hit) = self.lookup(uri, directory)? {
                    return Ok(hit);
                }
                return Err(RunError::Download {
                    uri: uri.to_string(),
                    message: format!("cache entry {} vanished", entry.display()),
                });
            }
            remove_path(&entry)?;
        }

        let part = sibling(&entry, ".part");
        if part.exists() {
            remove_path(&part)?;
        }
        self.downloaders.for_uri(uri).fetch(uri, &part, directory)?;
        fs::rename(&part, &entry).map_err(|e| RunError::io(&entry, e))?;
        info!("Stored {} in download cache: {}", uri, entry.display());

        let lock = FileLock::acquire(&entry, LockMode::Shared)?;
        drop(writer);
        Ok(Localized {
            uri: uri.to_string(),
            path: entry,
            from_cache: false,
            _lock: Some(lock),
        })
    }

    /// Pre-populates the cache with `uris`.
    ///
    /// Returns each URI with its entry path, or `None` when it is not
    /// cacheable and was skipped.
    pub fn localize(&self, uris: &[String]) -> Result<Vec<(String, Option<PathBuf>)>> {
        if !self.cfg.put {
            return Err(RunError::Config(
                "localize requires download_cache.put = true".to_string(),
            ));
        }

        let mut results = Vec::with_capacity(uris.len());
        for uri in uris {
            let directory = uri.ends_with('/');
            if self.entry_path(uri, directory).is_none() {
                warn!("Skipping {}: not cacheable under the configured patterns", uri);
                results.push((uri.clone(), None));
                continue;
            }
            let localized = match self.lookup(uri, directory)? {
                Some(hit) => hit,
                None => self.fetch(uri, directory, &self.cfg.dir)?,
            };
            results.push((uri.clone(), Some(localized.path.clone())));
        }
        Ok(results)
    }
}

fn basename(uri: &str) -> String {
    let rest = uri.split_once("://").map(|(_, r)| r).unwrap_or(uri);
    let rest = rest.split(['?', '#']).next().unwrap_or_default();
    rest.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("download")
        .to_string()
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn remove_path(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| RunError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &Path) -> DownloadCacheConfig {
        DownloadCacheConfig {
            put: true,
            get: true,
            dir: dir.join("cache"),
            ..Default::default()
        }
    }

    fn source(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join("remote").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        format!("file://{}", path.display())
    }

    #[test]
    fn test_entry_path_layout() {
        let temp = tempdir().unwrap();
        let cache = DownloadCache::new(&config(temp.path())).unwrap();

        assert_eq!(
            cache.entry_path("https://example.org/data/ref.fa", false),
            Some(temp.path().join("cache/files/https/example.org/data/ref.fa"))
        );
        assert_eq!(
            cache.entry_path("gs://bucket/dir/", true),
            Some(temp.path().join("cache/dirs/gs/bucket/dir"))
        );
        assert_eq!(cache.entry_path("https://example.org/../etc/passwd", false), None);
        assert_eq!(cache.entry_path("/local/path", false), None);
    }

    #[test]
    fn test_query_string_handling() {
        let temp = tempdir().unwrap();
        let mut cfg = config(temp.path());
        let cache = DownloadCache::new(&cfg).unwrap();
        assert_eq!(cache.entry_path("https://x.org/a.txt?sig=1", false), None);

        cfg.ignore_query = true;
        let cache = DownloadCache::new(&cfg).unwrap();
        assert_eq!(
            cache.entry_path("https://x.org/a.txt?sig=1", false),
            cache.entry_path("https://x.org/a.txt", false)
        );
    }

    #[test]
    fn test_deny_beats_allow() {
        let temp = tempdir().unwrap();
        let mut cfg = config(temp.path());
        cfg.enable_patterns = vec!["file://*".to_string()];
        cfg.disable_patterns = vec!["*.php".to_string()];
        let cache = DownloadCache::new(&cfg).unwrap();

        let uri = source(temp.path(), "index.php", "<?php");
        assert!(!cache.eligible(&uri));

        let scratch = temp.path().join("scratch");
        let got = cache.resolve(&uri, false, &scratch).unwrap();
        assert!(!got.from_cache);
        assert!(got.path.starts_with(&scratch));
        assert_eq!(fs::read_to_string(&got.path).unwrap(), "<?php");
        assert!(!temp.path().join("cache/files").exists());
    }

    #[test]
    fn test_put_then_get() {
        let temp = tempdir().unwrap();
        let cache = DownloadCache::new(&config(temp.path())).unwrap();
        let uri = source(temp.path(), "ref.fa", ">chr1");
        let scratch = temp.path().join("scratch");

        let first = cache.resolve(&uri, false, &scratch).unwrap();
        assert!(!first.from_cache);
        assert!(first.path.starts_with(temp.path().join("cache/files/file")));
        drop(first);

        // the source is gone; a hit must not re-download
        fs::remove_file(temp.path().join("remote/ref.fa")).unwrap();
        let second = cache.resolve(&uri, false, &scratch).unwrap();
        assert!(second.from_cache);
        assert_eq!(fs::read_to_string(&second.path).unwrap(), ">chr1");
    }

    #[test]
    fn test_get_disabled_downloads_again() {
        let temp = tempdir().unwrap();
        let mut cfg = config(temp.path());
        cfg.get = false;
        let cache = DownloadCache::new(&cfg).unwrap();
        let uri = source(temp.path(), "a.txt", "v1");
        let scratch = temp.path().join("scratch");

        cache.resolve(&uri, false, &scratch).unwrap();
        fs::write(temp.path().join("remote/a.txt"), "v2").unwrap();
        let again = cache.resolve(&uri, false, &scratch).unwrap();
        assert!(!again.from_cache);
        assert_eq!(fs::read_to_string(&again.path).unwrap(), "v2");
    }

    #[test]
    fn test_directory_download() {
        let temp = tempdir().unwrap();
        let cache = DownloadCache::new(&config(temp.path())).unwrap();
        let remote = temp.path().join("remote/bundle");
        fs::create_dir_all(&remote).unwrap();
        fs::write(remote.join("x.txt"), "x").unwrap();

        let uri = format!("file://{}/", remote.display());
        let got = cache.resolve(&uri, true, &temp.path().join("scratch")).unwrap();
        assert!(got.path.starts_with(temp.path().join("cache/dirs")));
        assert!(got.path.join("x.txt").exists());
    }

    #[test]
    fn test_localize() {
        let temp = tempdir().unwrap();
        let mut cfg = config(temp.path());
        cfg.disable_patterns = vec!["*.aspx".to_string()];
        let cache = DownloadCache::new(&cfg).unwrap();

        let good = source(temp.path(), "good.txt", "ok");
        let bad = source(temp.path(), "page.aspx", "no");
        let results = cache.localize(&[good.clone(), bad.clone()]).unwrap();
        assert!(results[0].1.as_ref().unwrap().exists());
        assert_eq!(results[1], (bad, None));

        cfg.put = false;
        let cache = DownloadCache::new(&cfg).unwrap();
        assert!(matches!(cache.localize(&[good]), Err(RunError::Config(_))));
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("https://x.org/a/b.txt?x=1"), "b.txt");
        assert_eq!(basename("s3://bucket/dir/"), "dir");
        assert_eq!(basename("https://x.org"), "x.org");
    }
}
