//! Scripted backend for tests.
//!
//! Each task name maps to a list of poll responses; the last one repeats.
//! Tasks without a script run once and succeed. Every call is recorded.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::state::ContainerStatus;
use super::{ContainerBackend, ContainerSpec};
use crate::error::{Result, RunError};

/// One scripted poll response.
#[derive(Debug, Clone)]
pub(crate) enum FakeStep {
    Status(ContainerStatus),
    Transient,
    Permanent,
}

type CreateHook = Arc<dyn Fn(&ContainerSpec) + Send + Sync>;

#[derive(Default)]
struct Inner {
    scripts: HashMap<String, Vec<FakeStep>>,
    hooks: HashMap<String, CreateHook>,
    /// container id -> (task, next step)
    containers: HashMap<String, (String, usize)>,
    created: Vec<ContainerSpec>,
    polls: Vec<(String, Instant)>,
    destroyed: Vec<(String, Instant)>,
    live: usize,
    peak_live: usize,
    next_id: usize,
}

#[derive(Default)]
pub(crate) struct FakeBackend {
    inner: Mutex<Inner>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn script(&self, task: &str, steps: Vec<FakeStep>) {
        self.lock().scripts.insert(task.to_string(), steps);
    }

    /// Runs `hook` when a container for `task` is created.
    pub fn on_create<F>(&self, task: &str, hook: F)
    where
        F: Fn(&ContainerSpec) + Send + Sync + 'static,
    {
        self.lock().hooks.insert(task.to_string(), Arc::new(hook));
    }

    /// Writes `files` (relative path, contents) into the task's working directory on create.
    pub fn writes(&self, task: &str, files: &[(&str, &str)]) {
        let files: Vec<(String, String)> = files
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect();
        self.on_create(task, move |spec| {
            let Some(work) = spec.host_path(&spec.workdir).map(Path::to_path_buf) else {
                return;
            };
            for (rel, contents) in &files {
                let path: PathBuf = work.join(rel);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).unwrap();
                }
                fs::write(&path, contents).unwrap();
            }
        });
    }

    /// Registers a container for `task` without a spec.
    pub fn create_for_test(&self, task: &str) -> String {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = format!("fake-{}", inner.next_id);
        inner.containers.insert(id.clone(), (task.to_string(), 0));
        inner.live += 1;
        inner.peak_live = inner.peak_live.max(inner.live);
        id
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.lock().created.clone()
    }

    pub fn poll_times(&self, task: &str) -> Vec<Instant> {
        self.lock()
            .polls
            .iter()
            .filter(|(t, _)| t == task)
            .map(|(_, at)| *at)
            .collect()
    }

    /// Task names of destroyed containers, in order.
    pub fn destroyed(&self) -> Vec<String> {
        self.lock().destroyed.iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn destroyed_at(&self, task: &str) -> Option<Instant> {
        self.lock()
            .destroyed
            .iter()
            .find(|(t, _)| t == task)
            .map(|(_, at)| *at)
    }

    /// Most containers alive at once.
    pub fn peak_live(&self) -> usize {
        self.lock().peak_live
    }
}

impl ContainerBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let id = self.create_for_test(&spec.task);
        let hook = {
            let mut inner = self.lock();
            inner.created.push(spec.clone());
            inner.hooks.get(&spec.task).cloned()
        };
        if let Some(hook) = hook {
            hook(spec);
        }
        Ok(id)
    }

    fn poll(&self, id: &str) -> Result<ContainerStatus> {
        let mut inner = self.lock();
        let (task, index) = inner
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| RunError::backend(format!("no such container: {}", id)))?;
        inner.polls.push((task.clone(), Instant::now()));

        let step = match inner.scripts.get(&task) {
            Some(steps) if !steps.is_empty() => steps[index.min(steps.len() - 1)].clone(),
            _ => FakeStep::Status(ContainerStatus::exited(0)),
        };
        if let Some(entry) = inner.containers.get_mut(id) {
            entry.1 += 1;
        }

        match step {
            FakeStep::Status(status) => Ok(status),
            FakeStep::Transient => Err(RunError::transient("503 Service Unavailable")),
            FakeStep::Permanent => Err(RunError::backend("no such image")),
        }
    }

    fn destroy(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some((task, _)) = inner.containers.remove(id) {
            inner.destroyed.push((task, Instant::now()));
            inner.live = inner.live.saturating_sub(1);
        }
        Ok(())
    }

    fn normalize_ownership(&self, _dir: &Path, _uid: u32, _gid: u32) -> Result<()> {
        Ok(())
    }
}
