//! Cleanup and Ownership
//!
//! Deletes a finished task's `work/` (and private `tmp/`) according to the
//! cleanup policy, and re-owns task directories to the invoking user when
//! containers ran as root.

use std::fs;
use std::path::Path;

use log::{debug, info, warn};
use nix::unistd::{geteuid, getgid, getuid};

use super::TaskDir;
use crate::config::CleanupPolicy;
use crate::error::{Result, RunError};

/// Applies `policy` to a task that ended with `succeeded`.
///
/// Deletion is skipped unless outputs are hard links, since it would
/// otherwise remove the only copy of a symlinked output. Run metadata
/// (`command`, JSON dumps, captured streams) is never removed. Returns
/// whether anything was deleted.
pub fn apply_cleanup(
    label: &str,
    dir: &TaskDir,
    policy: CleanupPolicy,
    succeeded: bool,
    hardlinks: bool,
) -> Result<bool> {
    if !policy.applies(succeeded) {
        return Ok(false);
    }
    if !hardlinks {
        warn!(
            "[{}] skipping delete_work = {:?}: requires file_io.output_hardlinks",
            label, policy
        );
        return Ok(false);
    }

    for path in [dir.work(), dir.tmp()] {
        if path.exists() {
            fs::remove_dir_all(&path).map_err(|e| RunError::io(&path, e))?;
        }
    }
    info!("[{}] deleted working directory", label);
    Ok(true)
}

/// Real uid and gid of the invoking user.
pub fn invoking_ids() -> (u32, u32) {
    (getuid().as_raw(), getgid().as_raw())
}

/// `uid:gid` for running containers as the invoking user.
pub fn invoking_user() -> String {
    let (uid, gid) = invoking_ids();
    format!("{}:{}", uid, gid)
}

/// Whether this process runs with root privileges.
pub fn running_as_root() -> bool {
    geteuid().is_root()
}

/// Recursively re-owns `dir` to `uid:gid` without following symlinks.
pub fn chown_tree(dir: &Path, uid: u32, gid: u32) -> Result<()> {
    std::os::unix::fs::lchown(dir, Some(uid), Some(gid)).map_err(|e| RunError::io(dir, e))?;

    let meta = fs::symlink_metadata(dir).map_err(|e| RunError::io(dir, e))?;
    if meta.is_dir() {
        for entry in fs::read_dir(dir).map_err(|e| RunError::io(dir, e))? {
            let entry = entry.map_err(|e| RunError::io(dir, e))?;
            chown_tree(&entry.path(), uid, gid)?;
        }
    }
    debug!("Re-owned {} to {}:{}", dir.display(), uid, gid);
    Ok(())
}
