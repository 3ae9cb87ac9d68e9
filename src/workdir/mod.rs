//! Task Working Directories
//!
//! Each task call owns a directory under its run:
//!
//! ```text
//! call-<id>/
//!   command        script run inside the container
//!   inputs.json    resolved input values
//!   outputs.json   output values (after success)
//!   stdout.txt
//!   stderr.txt
//!   work/          container working directory
//!   out/           links to declared outputs
//!   tmp/           optional private /tmp
//! ```
//!
//! # Architecture
//!
//! - [`confine`]: root confinement checks
//! - [`outputs`]: output collection and link materialization
//! - [`cleanup`]: cleanup policy and ownership normalization

pub mod cleanup;
pub mod confine;
pub mod outputs;

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Serialize;

use crate::container::Mount;
use crate::error::{Result, RunError};
use crate::workflow::Value;

/// Mount point of the task directory inside the container.
pub const CONTAINER_ROOT: &str = "/mnt/task";

/// Filesystem layout of one task call.
#[derive(Debug, Clone)]
pub struct TaskDir {
    root: PathBuf,
}

impl TaskDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the directory and its `work/` subdirectory.
    pub fn create(&self) -> Result<()> {
        for dir in [&self.root, &self.work()] {
            fs::create_dir_all(dir).map_err(|e| RunError::io(dir, e))?;
        }
        debug!("Created task directory: {}", self.root.display());
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn command_file(&self) -> PathBuf {
        self.root.join("command")
    }

    pub fn inputs_json(&self) -> PathBuf {
        self.root.join("inputs.json")
    }

    pub fn outputs_json(&self) -> PathBuf {
        self.root.join("outputs.json")
    }

    pub fn stdout(&self) -> PathBuf {
        self.root.join("stdout.txt")
    }

    pub fn stderr(&self) -> PathBuf {
        self.root.join("stderr.txt")
    }

    pub fn work(&self) -> PathBuf {
        self.root.join("work")
    }

    pub fn out(&self) -> PathBuf {
        self.root.join("out")
    }

    pub fn tmp(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Container-side path of a file within the task directory.
    pub fn container_path(rel: &str) -> PathBuf {
        Path::new(CONTAINER_ROOT).join(rel)
    }
}

/// Inputs rewritten to their container-side locations, plus the mounts
/// that make them visible.
#[derive(Debug, Clone, Default)]
pub struct StagedInputs {
    pub inputs: BTreeMap<String, Value>,
    pub mounts: Vec<Mount>,
}

/// Stages local input files for the container.
///
/// Files in the same host directory share a staging directory, numbered in
/// order of first appearance. In mount mode each file is bind-mounted
/// read-only; in copy mode it is copied under `work/_inputs/` so the
/// command may modify it.
pub fn stage_inputs(dir: &TaskDir, inputs: &BTreeMap<String, Value>, copy: bool) -> Result<StagedInputs> {
    let mut parents: HashMap<PathBuf, usize> = HashMap::new();
    let mut staged: HashMap<String, String> = HashMap::new();
    let mut mounts = Vec::new();

    let mut rewrite = |host: &str, is_dir: bool| -> Result<String> {
        if let Some(done) = staged.get(host) {
            return Ok(done.clone());
        }

        let host_path = PathBuf::from(host.trim_end_matches('/'));
        let meta = fs::metadata(&host_path).map_err(|e| RunError::io(&host_path, e))?;
        if meta.is_dir() != is_dir {
            return Err(RunError::Plan(format!(
                "input '{}' is {} a directory",
                host,
                if is_dir { "not" } else { "unexpectedly" }
            )));
        }

        let parent = host_path.parent().map(Path::to_path_buf).unwrap_or_default();
        let next = parents.len();
        let index = *parents.entry(parent).or_insert(next);
        let name = host_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());

        let container = if copy {
            let rel = format!("_inputs/{}/{}", index, name);
            let dest = dir.work().join(&rel);
            copy_path(&host_path, &dest)?;
            Path::new(CONTAINER_ROOT).join("work").join(rel)
        } else {
            let container = Path::new(CONTAINER_ROOT)
                .join("inputs")
                .join(index.to_string())
                .join(&name);
            mounts.push(Mount::new(&host_path, &container, true));
            container
        };

        let container = container.display().to_string();
        staged.insert(host.to_string(), container.clone());
        Ok(container)
    };

    let mut rewritten = BTreeMap::new();
    for (name, value) in inputs {
        rewritten.insert(name.clone(), value.map_paths(&mut rewrite)?);
    }

    Ok(StagedInputs {
        inputs: rewritten,
        mounts,
    })
}

/// Copies a file, or a directory recursively.
pub fn copy_path(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| RunError::io(parent, e))?;
    }
    let meta = fs::metadata(src).map_err(|e| RunError::io(src, e))?;
    if !meta.is_dir() {
        fs::copy(src, dest).map_err(|e| RunError::io(src, e))?;
        return Ok(());
    }

    fs::create_dir_all(dest).map_err(|e| RunError::io(dest, e))?;
    for entry in fs::read_dir(src).map_err(|e| RunError::io(src, e))? {
        let entry = entry.map_err(|e| RunError::io(src, e))?;
        copy_path(&entry.path(), &dest.join(entry.file_name()))?;
    }
    Ok(())
}

/// Substitutes `~{name}` placeholders with rendered input values.
///
/// Unknown placeholders are left as written.
pub fn render_command(template: &str, inputs: &BTreeMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("~{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = after[..end].trim();
                match inputs.get(name) {
                    Some(value) => out.push_str(&value.render()),
                    None => {
                        warn!("Command references unknown input '{}'", name);
                        out.push_str(&rest[start..start + 2 + end + 1]);
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Writes the command script with its interpreter line and preamble.
pub fn write_command(dir: &TaskDir, shell: &str, preamble: &str, command: &str) -> Result<PathBuf> {
    let path = dir.command_file();
    let mut file = File::create(&path).map_err(|e| RunError::io(&path, e))?;

    let write = |file: &mut File| -> std::io::Result<()> {
        writeln!(file, "#!{}", shell)?;
        if !preamble.trim().is_empty() {
            writeln!(file, "{}", preamble)?;
        }
        writeln!(file, "{}", command)
    };
    write(&mut file).map_err(|e| RunError::io(&path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .map_err(|e| RunError::io(&path, e))?;
    }

    Ok(path)
}

/// Serializes `value` as pretty JSON to `path`.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text + "\n").map_err(|e| RunError::io(path, e))
}
