//! Output Collection and Materialization
//!
//! After a task succeeds, each declared output is located in `work/` and
//! linked under an `out/` tree in one of two layouts:
//!
//! - default: `out/<prefix><output name>/<basename>`, which cannot collide
//! - relative: `out/<declared path>`, which fails with `NamingCollision`
//!   when two outputs alias the same path
//!
//! Destinations are claimed before any link is created, so a collision
//! leaves no partial links behind.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info};

use super::confine::path_within;
use super::TaskDir;
use crate::error::{Result, RunError};
use crate::workflow::{OutputDecl, Value};

/// How output links are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Symlink,
    Hardlink,
}

impl LinkKind {
    pub fn from_hardlinks(hardlinks: bool) -> Self {
        if hardlinks {
            Self::Hardlink
        } else {
            Self::Symlink
        }
    }
}

/// Where output links are placed under `out/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Default,
    Relative,
}

impl Layout {
    pub fn from_relative(relative: bool) -> Self {
        if relative {
            Self::Relative
        } else {
            Self::Default
        }
    }
}

/// Destinations already claimed in a run's `out/` tree.
#[derive(Debug, Default)]
pub struct OutputRegistry {
    claims: Mutex<HashMap<PathBuf, String>>,
}

impl OutputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims every destination or none of them.
    pub fn claim_all(&self, claims: &[(PathBuf, String)]) -> Result<()> {
        let mut held = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        for (dest, label) in claims {
            if let Some(existing) = held.get(dest) {
                return Err(RunError::NamingCollision {
                    path: dest.clone(),
                    output: label.clone(),
                    existing: existing.clone(),
                });
            }
        }
        for (dest, label) in claims {
            held.insert(dest.clone(), label.clone());
        }
        Ok(())
    }
}

/// Locates declared outputs in the task's `work/` directory.
///
/// Missing optional outputs become `Null`; a missing required output
/// fails with `MissingOutput`. Outputs must not resolve outside `work/`.
pub fn collect_outputs(task: &str, dir: &TaskDir, decls: &[OutputDecl]) -> Result<BTreeMap<String, Value>> {
    let work = dir.work();
    let mut outputs = BTreeMap::new();

    for decl in decls {
        let path = work.join(&decl.path);
        let present = match fs::metadata(&path) {
            Ok(meta) => meta.is_dir() == decl.directory,
            Err(_) => false,
        };

        if !present {
            if decl.optional {
                debug!("[{}] optional output '{}' absent", task, decl.name);
                outputs.insert(decl.name.clone(), Value::Null);
                continue;
            }
            return Err(RunError::MissingOutput {
                task: task.to_string(),
                output: decl.name.clone(),
                path,
            });
        }

        if !path_within(&path, &work) {
            return Err(RunError::PathConfinement { path, root: work });
        }

        let text = path.display().to_string();
        let value = if decl.directory {
            Value::Directory(text)
        } else {
            Value::File(text)
        };
        outputs.insert(decl.name.clone(), value);
    }

    Ok(outputs)
}

/// Links outputs under `out_root` and returns the values rewritten to the links.
///
/// `prefix` is prepended to output names in the default layout (e.g. the
/// call path at run level). With a `registry`, destinations are also
/// claimed across the run.
pub fn materialize(
    outputs: &BTreeMap<String, Value>,
    decls: &[OutputDecl],
    out_root: &Path,
    prefix: &str,
    layout: Layout,
    link: LinkKind,
    registry: Option<&OutputRegistry>,
) -> Result<BTreeMap<String, Value>> {
    let mut plan: Vec<(String, PathBuf, PathBuf)> = Vec::new();

    for (name, value) in outputs {
        let sources = value.file_refs();
        let decl_path = decls.iter().find(|d| &d.name == name).map(|d| d.path.as_str());

        for (index, (source, _)) in sources.iter().enumerate() {
            let source = PathBuf::from(source);
            let dest = match (layout, decl_path) {
                (Layout::Relative, Some(rel)) if sources.len() == 1 => out_root.join(rel),
                _ => {
                    let base = source
                        .file_name()
                        .map(|n| n.to_os_string())
                        .unwrap_or_else(|| name.clone().into());
                    let mut dir = out_root.join(format!("{}{}", prefix, name));
                    if sources.len() > 1 {
                        dir = dir.join(index.to_string());
                    }
                    dir.join(base)
                }
            };
            plan.push((format!("{}{}", prefix, name), source, dest));
        }
    }

    // claim phase
    let mut local: HashMap<&Path, &str> = HashMap::new();
    for (label, _, dest) in &plan {
        if let Some(existing) = local.insert(dest.as_path(), label.as_str()) {
            return Err(RunError::NamingCollision {
                path: dest.clone(),
                output: label.clone(),
                existing: existing.to_string(),
            });
        }
    }
    if let Some(registry) = registry {
        let claims: Vec<(PathBuf, String)> = plan
            .iter()
            .map(|(label, _, dest)| (dest.clone(), label.clone()))
            .collect();
        registry.claim_all(&claims)?;
    }

    // link phase
    let mut moved: HashMap<String, String> = HashMap::new();
    for (_, source, dest) in &plan {
        create_link(source, dest, link)?;
        moved.insert(source.display().to_string(), dest.display().to_string());
    }

    let mut linked = BTreeMap::new();
    for (name, value) in outputs {
        let rewritten = value.map_paths(&mut |p: &str, _| {
            Ok(moved.get(p).cloned().unwrap_or_else(|| p.to_string()))
        })?;
        linked.insert(name.clone(), rewritten);
    }

    if !plan.is_empty() {
        info!("Linked {} output(s) under {}", plan.len(), out_root.display());
    }
    Ok(linked)
}

/// Links `source` at `dest`, replacing anything already there.
pub fn create_link(source: &Path, dest: &Path, kind: LinkKind) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| RunError::io(parent, e))?;
    }
    if let Ok(meta) = fs::symlink_metadata(dest) {
        let removed = if meta.is_dir() {
            fs::remove_dir_all(dest)
        } else {
            fs::remove_file(dest)
        };
        removed.map_err(|e| RunError::io(dest, e))?;
    }

    match kind {
        LinkKind::Symlink => {
            let target = fs::canonicalize(source).map_err(|e| RunError::io(source, e))?;
            std::os::unix::fs::symlink(&target, dest).map_err(|e| RunError::io(dest, e))
        }
        LinkKind::Hardlink => hard_link_tree(source, dest),
    }
}

/// Hard links a file, or recreates a directory tree of hard links.
fn hard_link_tree(source: &Path, dest: &Path) -> Result<()> {
    let meta = fs::metadata(source).map_err(|e| RunError::io(source, e))?;
    if !meta.is_dir() {
        return fs::hard_link(source, dest).map_err(|e| RunError::io(dest, e));
    }

    fs::create_dir_all(dest).map_err(|e| RunError::io(dest, e))?;
    for entry in fs::read_dir(source).map_err(|e| RunError::io(source, e))? {
        let entry = entry.map_err(|e| RunError::io(source, e))?;
        hard_link_tree(&entry.path(), &dest.join(entry.file_name()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn task_with_output(rel: &str) -> (tempfile::TempDir, TaskDir, Vec<OutputDecl>) {
        let temp = tempdir().unwrap();
        let dir = TaskDir::new(temp.path().join("call-report"));
        dir.create().unwrap();
        let path = dir.work().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "report").unwrap();
        (temp, dir, vec![OutputDecl::file("my_report", rel)])
    }

    #[test]
    fn test_collect_outputs() {
        let (_temp, dir, mut decls) = task_with_output("reports/subdir/myreport.txt");
        decls.push(OutputDecl {
            name: "extra".into(),
            path: "missing.txt".into(),
            directory: false,
            optional: true,
        });

        let outputs = collect_outputs("report", &dir, &decls).unwrap();
        assert_eq!(
            outputs["my_report"],
            Value::file(dir.work().join("reports/subdir/myreport.txt").display().to_string())
        );
        assert_eq!(outputs["extra"], Value::Null);
    }

    #[test]
    fn test_missing_required_output() {
        let temp = tempdir().unwrap();
        let dir = TaskDir::new(temp.path());
        dir.create().unwrap();

        let err = collect_outputs("t", &dir, &[OutputDecl::file("x", "x.txt")]).unwrap_err();
        assert!(matches!(err, RunError::MissingOutput { .. }));
    }

    #[test]
    fn test_output_symlink_escape() {
        let temp = tempdir().unwrap();
        let dir = TaskDir::new(temp.path().join("call"));
        dir.create().unwrap();
        fs::write(temp.path().join("secret.txt"), "s").unwrap();
        std::os::unix::fs::symlink(temp.path().join("secret.txt"), dir.work().join("out.txt"))
            .unwrap();

        let err = collect_outputs("t", &dir, &[OutputDecl::file("x", "out.txt")]).unwrap_err();
        assert!(matches!(err, RunError::PathConfinement { .. }));
    }

    #[test]
    fn test_default_layout() {
        let (_temp, dir, decls) = task_with_output("reports/subdir/myreport.txt");
        let outputs = collect_outputs("report", &dir, &decls).unwrap();

        let linked = materialize(
            &outputs,
            &decls,
            &dir.out(),
            "",
            Layout::Default,
            LinkKind::Symlink,
            None,
        )
        .unwrap();

        let link = dir.out().join("my_report/myreport.txt");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&link).unwrap(), "report");
        assert_eq!(linked["my_report"], Value::file(link.display().to_string()));
    }

    #[test]
    fn test_relative_layout() {
        let (_temp, dir, decls) = task_with_output("reports/subdir/myreport.txt");
        let outputs = collect_outputs("report", &dir, &decls).unwrap();

        materialize(
            &outputs,
            &decls,
            &dir.out(),
            "",
            Layout::Relative,
            LinkKind::Hardlink,
            None,
        )
        .unwrap();

        let link = dir.out().join("reports/subdir/myreport.txt");
        let meta = fs::symlink_metadata(&link).unwrap();
        assert!(meta.file_type().is_file());
        assert_eq!(fs::read_to_string(&link).unwrap(), "report");
    }

    #[test]
    fn test_registry_collision_creates_no_links() {
        let registry = OutputRegistry::new();
        let temp = tempdir().unwrap();
        let run_out = temp.path().join("out");

        let (_a_temp, a_dir, a_decls) = task_with_output("data.txt");
        let a_out = collect_outputs("a", &a_dir, &a_decls).unwrap();
        materialize(&a_out, &a_decls, &run_out, "a.", Layout::Relative, LinkKind::Symlink, Some(&registry))
            .unwrap();

        let (_b_temp, b_dir, b_decls) = task_with_output("data.txt");
        let b_out = collect_outputs("b", &b_dir, &b_decls).unwrap();
        let err = materialize(&b_out, &b_decls, &run_out, "b.", Layout::Relative, LinkKind::Symlink, Some(&registry))
            .unwrap_err();

        match err {
            RunError::NamingCollision { output, existing, .. } => {
                assert_eq!(output, "b.my_report");
                assert_eq!(existing, "a.my_report");
            }
            other => panic!("expected collision, got {:?}", other),
        }
        // the first link still points at a's file
        let target = fs::read_link(run_out.join("data.txt")).unwrap();
        assert!(target.starts_with(fs::canonicalize(a_dir.root()).unwrap()));
    }

    #[test]
    fn test_hardlink_directory_tree() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/f.txt"), "f").unwrap();

        let dest = temp.path().join("dest");
        create_link(&src, &dest, LinkKind::Hardlink).unwrap();
        assert_eq!(fs::read_to_string(dest.join("nested/f.txt")).unwrap(), "f");

        // survives deletion of the source tree
        fs::remove_dir_all(&src).unwrap();
        assert_eq!(fs::read_to_string(dest.join("nested/f.txt")).unwrap(), "f");
    }
}
