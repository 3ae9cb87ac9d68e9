//! Workflow Scheduler
//!
//! The orchestrating core. A [`Scheduler`] owns the admission pools, the
//! container backend and both caches; a run walks the call graph, starting
//! a worker thread for every call whose dependencies completed, and
//! submits each task instance through [`Scheduler::submit`].
//!
//! # Failure policy
//!
//! The first failed task halts the run: calls not yet started are
//! skipped. With `fail_fast` the run's cancel token also fires, so every
//! in-flight poll loop destroys its container within one interval.
//! Without it, running tasks finish normally. Either way the run fails
//! with all task failures aggregated.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::Local;
use log::{error, info, warn};

use super::admission::{Admission, Limits, PoolKind};
use super::cancel::CancelToken;
use super::resources::{host_resources, Resources};
use super::scatter::scatter_tag;
use crate::cache::{CacheStorage, CallCache, DownloadCache, StorageRegistry};
use crate::config::Config;
use crate::container::{BackendRegistry, ContainerBackend, PollSettings};
use crate::error::{Result, RunError};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::workdir::confine::check_within;
use crate::workdir::outputs::OutputRegistry;
use crate::workflow::{execution_order, validate_plan, CallBody, CallNode, Scatter, Task, Value, WorkflowSpec};

/// One task instance submitted to the scheduler.
#[derive(Debug, Clone)]
pub struct TaskCall {
    pub task: Task,
    /// Dotted call path, e.g. `align` or `qc.count-0-sampleA`
    pub path: String,
    /// Directory of this call, e.g. `<run>/call-qc/call-count-0-sampleA`
    pub dir: PathBuf,
}

/// Result of submitting a task.
#[derive(Debug)]
pub enum TaskOutcome {
    /// Outputs reused from the call cache; no container ran
    CacheHit(BTreeMap<String, Value>),
    Completed(BTreeMap<String, Value>),
    Failed(RunError),
}

impl TaskOutcome {
    pub fn outputs(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::CacheHit(outputs) | Self::Completed(outputs) => Some(outputs),
            Self::Failed(_) => None,
        }
    }
}

/// State shared by every worker of one run.
#[derive(Debug)]
pub struct RunContext {
    pub dir: PathBuf,
    pub(super) cancel: CancelToken,
    halted: AtomicBool,
    pub(super) registry: OutputRegistry,
}

impl RunContext {
    pub fn new(dir: impl Into<PathBuf>, cancel: CancelToken) -> Self {
        Self {
            dir: dir.into(),
            cancel,
            halted: AtomicBool::new(false),
            registry: OutputRegistry::new(),
        }
    }

    /// Whether new work must not start.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    /// Stops new submissions, and with `fail_fast` cancels in-flight tasks.
    pub fn halt(&self, fail_fast: bool) {
        self.halted.store(true, Ordering::SeqCst);
        if fail_fast && !self.cancel.is_cancelled() {
            warn!("Cancelling all in-flight tasks (fail_fast)");
            self.cancel.cancel();
        }
    }

    /// External cancellation request.
    pub fn cancel(&self) {
        self.halt(true);
    }

    pub fn out_dir(&self) -> PathBuf {
        self.dir.join("out")
    }
}

/// Final state of a run.
#[derive(Debug)]
pub struct RunOutcome {
    pub dir: PathBuf,
    /// `<call path>.<output name>` to value
    pub outputs: BTreeMap<String, Value>,
    /// `(call path, error)` for every failed or interrupted task
    pub failures: Vec<(String, RunError)>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    /// Converts into `RunFailed` when any task failed.
    ///
    /// The reported cause is the first failure that was not merely an
    /// interruption caused by another task's failure.
    pub fn into_result(mut self) -> Result<(PathBuf, BTreeMap<String, Value>)> {
        if self.failures.is_empty() {
            return Ok((self.dir, self.outputs));
        }

        let failed = self.failures.len();
        let index = self
            .failures
            .iter()
            .position(|(_, e)| !matches!(e, RunError::Interrupted { .. }))
            .unwrap_or(0);
        let (call, cause) = self.failures.swap_remove(index);
        Err(RunError::RunFailed {
            failed,
            call,
            cause: Box::new(cause),
        })
    }
}

/// Outputs and failures of a call and everything under it.
#[derive(Debug, Default)]
struct CallResult {
    outputs: BTreeMap<String, Value>,
    failures: Vec<(String, RunError)>,
}

impl CallResult {
    fn failure(path: &str, error: RunError) -> Self {
        Self {
            outputs: BTreeMap::new(),
            failures: vec![(path.to_string(), error)],
        }
    }

    fn merge(&mut self, other: CallResult) {
        self.outputs.extend(other.outputs);
        self.failures.extend(other.failures);
    }

    fn has_real_failure(&self) -> bool {
        self.failures
            .iter()
            .any(|(_, e)| !matches!(e, RunError::Interrupted { .. }))
    }
}

/// Workflow scheduler.
///
/// # Example
///
/// ```rust,no_run
/// use std::path::Path;
/// use wdlrunner::{load_plan, Config, Scheduler};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let cfg = Config::load(None)?;
///     let plan = load_plan(Path::new("plan.yaml"), cfg.file_io.use_relative_output_paths)?;
///
///     let scheduler = Scheduler::new(cfg)?;
///     let (dir, outputs) = scheduler.run_workflow(&plan, Path::new("."))?.into_result()?;
///     println!("{} outputs in {}", outputs.len(), dir.display());
///     Ok(())
/// }
/// ```
pub struct Scheduler {
    pub(super) cfg: Config,
    pub(super) host: Resources,
    pub(super) admission: Arc<Admission>,
    pub(super) backend: Arc<dyn ContainerBackend>,
    pub(super) downloads: DownloadCache,
    pub(super) calls: CallCache,
    pub(super) poll: PollSettings,
    timeline: Mutex<ExecutionTimeline>,
}

impl Scheduler {
    /// Builds a scheduler with the built-in backends and cache storage.
    pub fn new(cfg: Config) -> Result<Self> {
        Self::with_registries(cfg, &BackendRegistry::new(), &StorageRegistry::new())
    }

    /// Builds a scheduler, resolving externally registered implementations.
    pub fn with_registries(cfg: Config, backends: &BackendRegistry, storages: &StorageRegistry) -> Result<Self> {
        let backend = backends.build(&cfg.container)?;
        let storage = storages.build(&cfg.call_cache)?;
        Self::assemble(cfg, backend, storage)
    }

    /// Builds a scheduler around an already constructed backend.
    pub fn with_backend(cfg: Config, backend: Arc<dyn ContainerBackend>) -> Result<Self> {
        let storage = StorageRegistry::new().build(&cfg.call_cache)?;
        Self::assemble(cfg, backend, storage)
    }

    fn assemble(cfg: Config, backend: Arc<dyn ContainerBackend>, storage: Arc<dyn CacheStorage>) -> Result<Self> {
        let host = host_resources(&cfg.scheduler);
        let limits = Limits::from_config(&cfg.scheduler, host);
        backend.prepare()?;

        info!(
            "Scheduler ready: backend={} tasks={} downloads={} host cpu={} memory={}",
            backend.name(),
            limits.tasks,
            limits.downloads,
            host.cpu,
            host.memory
        );

        Ok(Self {
            admission: Admission::new(limits, host),
            downloads: DownloadCache::new(&cfg.download_cache)?,
            calls: CallCache::new(&cfg.call_cache, storage),
            poll: PollSettings::from_config(&cfg.container),
            timeline: Mutex::new(ExecutionTimeline::new()),
            host,
            backend,
            cfg,
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn download_cache(&self) -> &DownloadCache {
        &self.downloads
    }

    /// Snapshot of the events recorded so far.
    pub fn timeline(&self) -> ExecutionTimeline {
        self.timeline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(super) fn record(&self, call: &str, event: EventType) {
        self.timeline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_event(call, event);
    }

    /// Runs one task to an outcome. Failures halt `run`.
    pub fn submit(&self, call: &TaskCall, run: &RunContext) -> TaskOutcome {
        self.record(&call.path, EventType::Queued);
        info!("[{}] queued", call.path);

        match self.execute(call, run) {
            Ok(outcome) => {
                let event = match outcome {
                    TaskOutcome::CacheHit(_) => EventType::CacheHit,
                    _ => EventType::Completed,
                };
                self.record(&call.path, event);
                outcome
            }
            Err(e @ RunError::Interrupted { .. }) => {
                warn!("[{}] interrupted", call.path);
                self.record(&call.path, EventType::Cancelled);
                TaskOutcome::Failed(e)
            }
            Err(e) => {
                error!("[{}] failed: {}", call.path, e);
                self.record(&call.path, EventType::Failed);
                run.halt(self.cfg.scheduler.fail_fast);
                TaskOutcome::Failed(e)
            }
        }
    }

    /// Runs `workflow` in a new run directory under `dir`.
    pub fn run_workflow(&self, workflow: &WorkflowSpec, dir: &Path) -> Result<RunOutcome> {
        self.run_workflow_with(workflow, dir, CancelToken::new())
    }

    /// Like [`Scheduler::run_workflow`], observing an external cancel token.
    pub fn run_workflow_with(&self, workflow: &WorkflowSpec, dir: &Path, cancel: CancelToken) -> Result<RunOutcome> {
        validate_plan(workflow, self.cfg.file_io.use_relative_output_paths)?;

        let run_dir = create_run_dir(dir, &workflow.name, &self.cfg.file_io.root)?;
        info!("Run directory: {}", run_dir.display());

        let run = RunContext::new(&run_dir, cancel);
        let result = self.run_calls(&workflow.calls, &run_dir, "", 0, &run);

        let mut failures = result.failures;
        if failures.is_empty() && run.cancel.is_cancelled() {
            failures.push((
                workflow.name.clone(),
                RunError::Interrupted {
                    task: workflow.name.clone(),
                },
            ));
        }

        let summary = self.timeline().summary();
        info!(
            "Run '{}' finished: {} completed, {} cached, {} failed, {} cancelled",
            workflow.name, summary.completed, summary.cache_hits, summary.failed, summary.cancelled
        );

        Ok(RunOutcome {
            dir: run_dir,
            outputs: result.outputs,
            failures,
        })
    }

    /// Runs sibling calls in dependency order, each on its own thread.
    fn run_calls(&self, calls: &[CallNode], parent: &Path, prefix: &str, depth: usize, run: &RunContext) -> CallResult {
        let order = match execution_order(calls) {
            Ok(order) => order,
            Err(e) => return CallResult::failure(prefix.trim_end_matches('.'), e.into()),
        };

        let mut result = CallResult::default();
        let mut pending: VecDeque<usize> = order.into();
        let mut done: HashSet<&str> = HashSet::new();
        let mut blocked: HashSet<&str> = HashSet::new();

        thread::scope(|scope| {
            let (tx, rx) = channel::<(usize, CallResult)>();
            let mut running = 0;

            loop {
                let mut waiting = VecDeque::new();
                while let Some(index) = pending.pop_front() {
                    let node = &calls[index];
                    let path = format!("{}{}", prefix, node.id);

                    if node.after.iter().any(|d| blocked.contains(d.as_str())) {
                        info!("[{}] skipped: a dependency did not complete", path);
                        self.record(&path, EventType::Cancelled);
                        blocked.insert(node.id.as_str());
                    } else if !node.after.iter().all(|d| done.contains(d.as_str())) {
                        waiting.push_back(index);
                    } else if run.is_halted() {
                        info!("[{}] not started: run halted", path);
                        self.record(&path, EventType::Cancelled);
                        blocked.insert(node.id.as_str());
                    } else {
                        let tx = tx.clone();
                        scope.spawn(move || {
                            let dir = parent.join(format!("call-{}", node.id));
                            let outcome = self.run_body(&node.call, &dir, &path, depth, run);
                            if let Err(e) = tx.send((index, outcome)) {
                                error!("Failed to send completion signal: {}", e);
                            }
                        });
                        running += 1;
                    }
                }
                pending = waiting;

                if running == 0 {
                    break;
                }

                let Ok((index, outcome)) = rx.recv() else {
                    break;
                };
                running -= 1;

                let id = calls[index].id.as_str();
                if outcome.failures.is_empty() {
                    done.insert(id);
                } else {
                    if outcome.has_real_failure() {
                        run.halt(self.cfg.scheduler.fail_fast);
                    }
                    blocked.insert(id);
                }
                result.merge(outcome);
            }
        });

        result
    }

    fn run_body(&self, body: &CallBody, dir: &Path, path: &str, depth: usize, run: &RunContext) -> CallResult {
        match body {
            CallBody::Task(task) => {
                let call = TaskCall {
                    task: task.clone(),
                    path: path.to_string(),
                    dir: dir.to_path_buf(),
                };
                match self.submit(&call, run) {
                    TaskOutcome::CacheHit(outputs) | TaskOutcome::Completed(outputs) => CallResult {
                        outputs: outputs
                            .into_iter()
                            .map(|(name, value)| (format!("{}.{}", path, name), value))
                            .collect(),
                        failures: Vec::new(),
                    },
                    TaskOutcome::Failed(e) => CallResult::failure(path, e),
                }
            }
            CallBody::Workflow(sub) => self.run_subworkflow(sub, dir, path, depth, run),
            CallBody::Scatter(scatter) => self.run_scatter(scatter, dir, path, depth, run),
        }
    }

    fn run_subworkflow(
        &self,
        sub: &WorkflowSpec,
        dir: &Path,
        path: &str,
        depth: usize,
        run: &RunContext,
    ) -> CallResult {
        let lease = match self
            .admission
            .acquire(path, PoolKind::Subworkflow(depth), Resources::default(), &run.cancel)
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                return CallResult::failure(path, RunError::Interrupted { task: path.to_string() })
            }
            Err(e) => return CallResult::failure(path, e),
        };

        if let Err(e) = fs::create_dir_all(dir) {
            return CallResult::failure(path, RunError::io(dir, e));
        }
        info!("[{}] subworkflow '{}' started at depth {}", path, sub.name, depth + 1);

        let result = self.run_calls(&sub.calls, dir, &format!("{}.", path), depth + 1, run);
        drop(lease);
        result
    }

    /// Runs every scatter instance concurrently as `call-<id>-<tag>`.
    fn run_scatter(&self, scatter: &Scatter, dir: &Path, path: &str, depth: usize, run: &RunContext) -> CallResult {
        let base = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let max_len = self.cfg.scheduler.scatter_tag_max_length;

        let instances: Vec<(PathBuf, String, CallBody)> = scatter
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let tag = scatter_tag(index, item, max_len);
                (
                    dir.with_file_name(format!("{}-{}", base, tag)),
                    format!("{}-{}", path, tag),
                    scatter.body.bind(&scatter.variable, item),
                )
            })
            .collect();
        info!("[{}] scatter over {} item(s)", path, instances.len());

        let mut result = CallResult::default();
        thread::scope(|scope| {
            let handles: Vec<_> = instances
                .iter()
                .map(|(dir, path, body)| {
                    let handle = scope.spawn(move || self.run_body(body, dir, path, depth, run));
                    (path, handle)
                })
                .collect();

            for (path, handle) in handles {
                let outcome = handle.join().unwrap_or_else(|_| {
                    CallResult::failure(path, RunError::Plan(format!("worker for '{}' panicked", path)))
                });
                result.merge(outcome);
            }
        });
        result
    }
}

/// Creates `<dir>/<YYYYMMDD_HHMMSS>_<name>`, adding a suffix if it exists.
fn create_run_dir(dir: &Path, name: &str, root: &Path) -> Result<PathBuf> {
    let base = format!("{}_{}", Local::now().format("%Y%m%d_%H%M%S"), name);
    fs::create_dir_all(dir).map_err(|e| RunError::io(dir, e))?;

    let mut attempt = 1;
    loop {
        let candidate = if attempt == 1 {
            dir.join(&base)
        } else {
            dir.join(format!("{}_{}", base, attempt))
        };
        check_within(&candidate, root)?;
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(RunError::io(&candidate, e)),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("backend", &self.backend.name())
            .field("host", &self.host)
            .field("limits", &self.admission.limits())
            .finish()
    }
}
