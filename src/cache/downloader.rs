//! External Downloaders
//!
//! A [`Downloader`] fetches one URI to a local destination. Downloaders are
//! looked up by URI scheme in a [`DownloaderRegistry`]; schemes without a
//! registration use the configured command (`curl` by default). `file://`
//! URIs are copied locally.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use log::{debug, info};

use crate::error::{Result, RunError};
use crate::workdir::copy_path;

pub trait Downloader: Send + Sync {
    /// Fetches `uri` to `dest`, which does not exist yet.
    fn fetch(&self, uri: &str, dest: &Path, directory: bool) -> Result<()>;
}

/// Runs an external command built from a template.
///
/// `{uri}` and `{dest}` in the template are replaced per download.
#[derive(Debug, Clone)]
pub struct CommandDownloader {
    template: Vec<String>,
}

impl CommandDownloader {
    pub fn new(template: Vec<String>) -> Self {
        Self { template }
    }

    fn argv(&self, uri: &str, dest: &Path) -> Vec<String> {
        let dest = dest.display().to_string();
        self.template
            .iter()
            .map(|arg| arg.replace("{uri}", uri).replace("{dest}", &dest))
            .collect()
    }
}

impl Downloader for CommandDownloader {
    fn fetch(&self, uri: &str, dest: &Path, _directory: bool) -> Result<()> {
        let argv = self.argv(uri, dest);
        let Some((program, args)) = argv.split_first() else {
            return Err(RunError::Config("downloader command is empty".to_string()));
        };

        info!("Downloading {}", uri);
        debug!("Downloader command: {}", argv.join(" "));

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| RunError::Download {
                uri: uri.to_string(),
                message: format!("failed to run '{}': {}", program, e),
            })?;

        if !output.status.success() {
            return Err(RunError::Download {
                uri: uri.to_string(),
                message: format!(
                    "'{}' exited with {:?}: {}",
                    program,
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        if !dest.exists() {
            return Err(RunError::Download {
                uri: uri.to_string(),
                message: format!("'{}' produced no file at {}", program, dest.display()),
            });
        }
        Ok(())
    }
}

/// Copies `file://` URIs from the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct FileDownloader;

impl Downloader for FileDownloader {
    fn fetch(&self, uri: &str, dest: &Path, _directory: bool) -> Result<()> {
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        copy_path(Path::new(path), dest).map_err(|e| RunError::Download {
            uri: uri.to_string(),
            message: e.to_string(),
        })
    }
}

/// Scheme-to-downloader table with a fallback.
#[derive(Clone)]
pub struct DownloaderRegistry {
    by_scheme: HashMap<String, Arc<dyn Downloader>>,
    fallback: Arc<dyn Downloader>,
}

impl DownloaderRegistry {
    /// Registry with `file://` support and `template` for everything else.
    pub fn new(template: Vec<String>) -> Self {
        let mut by_scheme: HashMap<String, Arc<dyn Downloader>> = HashMap::new();
        by_scheme.insert("file".to_string(), Arc::new(FileDownloader));
        Self {
            by_scheme,
            fallback: Arc::new(CommandDownloader::new(template)),
        }
    }

    pub fn register(&mut self, scheme: impl Into<String>, downloader: Arc<dyn Downloader>) {
        self.by_scheme.insert(scheme.into().to_ascii_lowercase(), downloader);
    }

    pub fn for_uri(&self, uri: &str) -> Arc<dyn Downloader> {
        let scheme = uri
            .split_once("://")
            .map(|(s, _)| s.to_ascii_lowercase())
            .unwrap_or_default();
        self.by_scheme
            .get(&scheme)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

impl fmt::Debug for DownloaderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloaderRegistry")
            .field("schemes", &self.by_scheme.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_command_template() {
        let d = CommandDownloader::new(vec![
            "curl".into(),
            "-o".into(),
            "{dest}".into(),
            "{uri}".into(),
        ]);
        assert_eq!(
            d.argv("https://x/y.txt", Path::new("/tmp/d/y.txt")),
            vec!["curl", "-o", "/tmp/d/y.txt", "https://x/y.txt"]
        );
    }

    #[test]
    fn test_command_downloader_runs() {
        let temp = tempdir().unwrap();
        let dest = temp.path().join("got.txt");
        let d = CommandDownloader::new(vec![
            "sh".into(),
            "-c".into(),
            "printf '%s' \"$0\" > \"$1\"".into(),
            "{uri}".into(),
            "{dest}".into(),
        ]);
        d.fetch("https://example.org/a", &dest, false).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "https://example.org/a");
    }

    #[test]
    fn test_command_downloader_failure() {
        let temp = tempdir().unwrap();
        let d = CommandDownloader::new(vec!["false".into()]);
        let err = d.fetch("https://x", &temp.path().join("x"), false).unwrap_err();
        assert!(matches!(err, RunError::Download { .. }));
    }

    #[test]
    fn test_file_downloader_and_registry() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src.txt");
        fs::write(&src, "hello").unwrap();

        let registry = DownloaderRegistry::new(vec!["false".into()]);
        let uri = format!("file://{}", src.display());
        let dest = temp.path().join("dest.txt");
        registry.for_uri(&uri).fetch(&uri, &dest, false).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "hello");

        // unregistered schemes use the command fallback
        let err = registry
            .for_uri("s3://bucket/key")
            .fetch("s3://bucket/key", &temp.path().join("k"), false)
            .unwrap_err();
        assert!(matches!(err, RunError::Download { .. }));
    }
}
