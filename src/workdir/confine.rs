//! Root Confinement
//!
//! Every path a task touches must resolve within `file_io.root`. Paths are
//! resolved through symlinks where they exist, and lexically beyond the
//! deepest existing ancestor, so directories that are about to be created
//! can be checked too.

use std::path::{Component, Path, PathBuf};

use crate::error::{Result, RunError};

/// Lexically removes `.` and `..` components of an absolute path.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolves `path` to an absolute path, following symlinks of its existing prefix.
pub fn resolve(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    let absolute = normalize(&absolute);

    for ancestor in absolute.ancestors() {
        if let Ok(real) = ancestor.canonicalize() {
            return match absolute.strip_prefix(ancestor) {
                Ok(rest) if !rest.as_os_str().is_empty() => real.join(rest),
                _ => real,
            };
        }
    }
    absolute
}

/// Returns true if `path` resolves within `root`.
pub fn path_within(path: &Path, root: &Path) -> bool {
    resolve(path).starts_with(resolve(root))
}

/// Fails with `PathConfinement` unless `path` resolves within `root`.
pub fn check_within(path: &Path, root: &Path) -> Result<()> {
    if path_within(path, root) {
        Ok(())
    } else {
        Err(RunError::PathConfinement {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_within_root() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("data")).unwrap();

        assert!(path_within(&root.path().join("data"), root.path()));
        assert!(path_within(&root.path().join("not/yet/created"), root.path()));
        assert!(path_within(Path::new("/anything"), Path::new("/")));
    }

    #[test]
    fn test_dotdot_escape() {
        let root = tempdir().unwrap();
        let escaped = root.path().join("data/../../etc/passwd");
        assert!(!path_within(&escaped, root.path()));
        assert!(matches!(
            check_within(&escaped, root.path()),
            Err(RunError::PathConfinement { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape() {
        let root = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        assert!(!path_within(&root.path().join("link/file.txt"), root.path()));
    }

    #[test]
    fn test_prefix_is_not_containment() {
        let root = tempdir().unwrap();
        let sibling = format!("{}-other/file", root.path().display());
        assert!(!path_within(Path::new(&sibling), root.path()));
    }
}
