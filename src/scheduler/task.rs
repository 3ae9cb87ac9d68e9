//! Task Lifecycle
//!
//! Everything between submission and outcome for one task instance:
//!
//! 1. clamp the resource request and run pre-flight checks (confinement,
//!    network allow-list, privilege), before any container exists
//! 2. consult the call cache; a hit links the cached outputs and stops
//! 3. localize URI inputs under download leases
//! 4. wait for a task lease (slot + cpu/memory reservation)
//! 5. stage inputs, write the command, create and poll the container
//! 6. collect and link outputs, normalize ownership, clean up, store in
//!    the call cache
//!
//! The lease, the container and cache locks are released on every path
//! out of this module by their guards.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::path::Path;

use log::{debug, info, warn};
use rand::Rng;

use super::admission::PoolKind;
use super::engine::{RunContext, Scheduler, TaskCall, TaskOutcome};
use super::resources::{clamp_request, Resources};
use crate::cache::Localized;
use crate::container::{drive, ContainerBackend, ContainerHandle, ContainerSpec, ContainerState, Mount};
use crate::error::{Result, RunError};
use crate::monitoring::EventType;
use crate::workdir::cleanup::{apply_cleanup, invoking_ids, invoking_user, running_as_root};
use crate::workdir::confine::check_within;
use crate::workdir::outputs::{collect_outputs, materialize, Layout, LinkKind};
use crate::workdir::{render_command, stage_inputs, write_command, write_json, TaskDir, CONTAINER_ROOT};
use crate::workflow::value::is_uri;
use crate::workflow::{Task, Value};

/// Destroys the container when dropped.
struct ContainerGuard<'a> {
    backend: &'a dyn ContainerBackend,
    id: String,
    label: String,
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        match self.backend.destroy(&self.id) {
            Ok(()) => debug!("[{}] container {} removed", self.label, self.id),
            Err(e) => warn!("[{}] failed to remove container {}: {}", self.label, self.id, e),
        }
    }
}

impl Scheduler {
    pub(super) fn execute(&self, call: &TaskCall, run: &RunContext) -> Result<TaskOutcome> {
        let task = &call.task;
        let label = call.path.as_str();
        let interrupted = || RunError::Interrupted {
            task: label.to_string(),
        };

        if run.is_halted() {
            return Err(interrupted());
        }

        let request = clamp_request(&task.name, &task.resources, &self.cfg.task_runtime, self.host)?;
        self.preflight(call)?;

        let dir = TaskDir::new(&call.dir);
        if let Some(entry) = self.calls.lookup(task, &task.inputs) {
            dir.create()?;
            write_json(&dir.inputs_json(), &task.inputs)?;
            let linked = self.link_task_outputs(&entry.outputs, task, &dir)?;
            let published = self.publish(call, &linked, run)?;
            write_json(&dir.outputs_json(), &linked)?;
            info!("[{}] reused outputs from call cache", label);
            return Ok(TaskOutcome::CacheHit(published));
        }

        dir.create()?;
        write_json(&dir.inputs_json(), &task.inputs)?;

        // held until the task finishes so cache entries stay marked in use
        let (inputs, _downloads) = self.localize_inputs(call, &dir, run)?;

        let Some(lease) = self.admission.acquire(label, PoolKind::Task, request, &run.cancel)? else {
            return Err(interrupted());
        };
        if run.is_halted() {
            return Err(interrupted());
        }
        self.record(label, EventType::Started);
        info!(
            "[{}] admitted (cpu={} memory={})",
            label,
            lease.resources().cpu,
            lease.resources().memory
        );

        let ran = self.run_container(call, &dir, &inputs, lease.resources(), run);
        drop(lease);
        if let Err(e) = ran {
            self.finish(call, &dir, false);
            return Err(e);
        }

        let linked = collect_outputs(label, &dir, &task.outputs).and_then(|outputs| {
            let linked = self.link_task_outputs(&outputs, task, &dir)?;
            let published = self.publish(call, &linked, run)?;
            write_json(&dir.outputs_json(), &linked)?;
            Ok((linked, published))
        });
        self.finish(call, &dir, linked.is_ok());
        let (linked, published) = linked?;

        if let Err(e) = self.calls.store(task, &task.inputs, &linked) {
            warn!("[{}] failed to store call cache entry: {}", label, e);
        }
        Ok(TaskOutcome::Completed(published))
    }

    /// Creates the container and polls it to a terminal state. Anything but
    /// success is an error; the container is gone when this returns.
    fn run_container(
        &self,
        call: &TaskCall,
        dir: &TaskDir,
        inputs: &BTreeMap<String, Value>,
        reserved: Resources,
        run: &RunContext,
    ) -> Result<()> {
        let label = call.path.as_str();
        let spec = self.prepare_container(call, dir, inputs, reserved)?;
        let id = self.backend.create(&spec)?;
        let guard = ContainerGuard {
            backend: self.backend.as_ref(),
            id: id.clone(),
            label: label.to_string(),
        };
        info!("[{}] container {} created ({})", label, id, spec.image);

        let mut handle = ContainerHandle::new(&id, label);
        let state = drive(self.backend.as_ref(), &mut handle, &self.poll, &run.cancel)?;
        drop(guard);
        handle.reap();
        info!("[{}] container finished: {}", label, state);

        if let Some(message) = handle.message() {
            if state != ContainerState::Succeeded {
                warn!("[{}] {}", label, message);
            }
        }
        match state {
            ContainerState::Failed => Err(RunError::CommandFailed {
                task: label.to_string(),
                exit_status: handle.exit_status().unwrap_or(-1),
                stderr: dir.stderr(),
            }),
            // only a cancelled run kills its own containers
            ContainerState::Killed if run.cancel.is_cancelled() => Err(RunError::Interrupted {
                task: label.to_string(),
            }),
            ContainerState::Killed => Err(RunError::backend(format!(
                "container {} of task '{}' was killed outside the run",
                id, label
            ))),
            _ => Ok(()),
        }
    }

    /// Checks that must pass before anything is created.
    fn preflight(&self, call: &TaskCall) -> Result<()> {
        let task = &call.task;
        let file_io = &self.cfg.file_io;

        check_within(&call.dir, &file_io.root)?;

        if !file_io.allow_any_input && !file_io.copy_inputs_for(&task.name) {
            for value in task.inputs.values() {
                for (path, _) in value.file_refs() {
                    if !is_uri(path) {
                        check_within(Path::new(path), &file_io.root)?;
                    }
                }
            }
        }

        if let Some(network) = &task.runtime.network {
            if !self.cfg.container.allow_networks.iter().any(|n| n == network) {
                return Err(RunError::NetworkRejected {
                    task: call.path.clone(),
                    network: network.clone(),
                });
            }
        }

        if task.runtime.privileged && !self.cfg.task_runtime.allow_privileged {
            return Err(RunError::Config(format!(
                "task '{}' requests privileged mode but task_runtime.allow_privileged is off",
                call.path
            )));
        }
        Ok(())
    }

    /// Replaces URI inputs with local paths, downloading under download leases.
    fn localize_inputs(
        &self,
        call: &TaskCall,
        dir: &TaskDir,
        run: &RunContext,
    ) -> Result<(BTreeMap<String, Value>, Vec<Localized>)> {
        let uris: HashSet<(String, bool)> = call
            .task
            .inputs
            .values()
            .flat_map(|v| v.file_refs())
            .filter(|(p, _)| is_uri(p))
            .map(|(p, is_dir)| (p.to_string(), is_dir))
            .collect();
        if uris.is_empty() {
            return Ok((call.task.inputs.clone(), Vec::new()));
        }

        let scratch = dir.root().join("download");
        let mut localized = Vec::with_capacity(uris.len());
        for (uri, is_dir) in uris {
            if let Some(hit) = self.downloads.lookup(&uri, is_dir)? {
                localized.push(hit);
                continue;
            }
            let Some(_lease) = self
                .admission
                .acquire(&uri, PoolKind::Download, Resources::default(), &run.cancel)?
            else {
                return Err(RunError::Interrupted {
                    task: call.path.clone(),
                });
            };
            localized.push(self.downloads.fetch(&uri, is_dir, &scratch)?);
        }

        let mut inputs = BTreeMap::new();
        for (name, value) in &call.task.inputs {
            let value = value.map_paths(&mut |p: &str, _| {
                Ok(localized
                    .iter()
                    .find(|l| l.uri == p)
                    .map(|l| l.path.display().to_string())
                    .unwrap_or_else(|| p.to_string()))
            })?;
            inputs.insert(name.clone(), value);
        }
        Ok((inputs, localized))
    }

    /// Stages inputs and the command script and describes the container.
    fn prepare_container(
        &self,
        call: &TaskCall,
        dir: &TaskDir,
        inputs: &BTreeMap<String, Value>,
        reserved: Resources,
    ) -> Result<ContainerSpec> {
        let task = &call.task;
        let runtime = &self.cfg.task_runtime;

        let staged = stage_inputs(dir, inputs, self.cfg.file_io.copy_inputs_for(&task.name))?;
        let command = render_command(&task.command, &staged.inputs);
        write_command(dir, &runtime.command_shell, &runtime.command_preamble, &command)?;
        for stream in [dir.stdout(), dir.stderr()] {
            File::create(&stream).map_err(|e| RunError::io(&stream, e))?;
        }

        let mut mounts = staged.mounts;
        mounts.push(Mount::new(dir.command_file(), TaskDir::container_path("command"), true));
        mounts.push(Mount::new(dir.stdout(), TaskDir::container_path("stdout.txt"), false));
        mounts.push(Mount::new(dir.stderr(), TaskDir::container_path("stderr.txt"), false));
        mounts.push(Mount::new(dir.work(), TaskDir::container_path("work"), false));
        if self.cfg.file_io.mount_tmpdir_for(&task.name, task.runtime.mount_tmpdir) {
            let tmp = dir.tmp();
            fs::create_dir_all(&tmp).map_err(|e| RunError::io(&tmp, e))?;
            mounts.push(Mount::new(tmp, "/tmp", false));
        }

        let shell = &runtime.command_shell;
        let memory_limit = if runtime.memory_limit_multiplier > 0.0 && reserved.memory > 0 {
            (reserved.memory as f64 * runtime.memory_limit_multiplier) as u64
        } else {
            0
        };

        Ok(ContainerSpec {
            name: container_name(&call.path),
            task: task.name.clone(),
            image: task
                .image
                .clone()
                .unwrap_or_else(|| runtime.defaults.image.clone()),
            command: vec![
                shell.clone(),
                "-c".to_string(),
                format!(
                    "{shell} {root}/command >> {root}/stdout.txt 2>> {root}/stderr.txt",
                    shell = shell,
                    root = CONTAINER_ROOT
                ),
            ],
            workdir: TaskDir::container_path("work"),
            cpu: reserved.cpu,
            memory_reservation: reserved.memory,
            memory_limit,
            mounts,
            env: runtime.resolved_env(),
            network: task.runtime.network.clone(),
            privileged: task.runtime.privileged,
            user: runtime.as_user.then(invoking_user),
        })
    }

    fn link_task_outputs(&self, outputs: &BTreeMap<String, Value>, task: &Task, dir: &TaskDir) -> Result<BTreeMap<String, Value>> {
        let file_io = &self.cfg.file_io;
        materialize(
            outputs,
            &task.outputs,
            &dir.out(),
            "",
            Layout::from_relative(file_io.use_relative_output_paths),
            LinkKind::from_hardlinks(file_io.output_hardlinks),
            None,
        )
    }

    /// Links outputs into the run's `out/`, claiming destinations run-wide.
    fn publish(&self, call: &TaskCall, linked: &BTreeMap<String, Value>, run: &RunContext) -> Result<BTreeMap<String, Value>> {
        let file_io = &self.cfg.file_io;
        materialize(
            linked,
            &call.task.outputs,
            &run.out_dir(),
            &format!("{}.", call.path),
            Layout::from_relative(file_io.use_relative_output_paths),
            LinkKind::from_hardlinks(file_io.output_hardlinks),
            Some(&run.registry),
        )
    }

    /// Ownership normalization and cleanup; failures here only warn.
    fn finish(&self, call: &TaskCall, dir: &TaskDir, succeeded: bool) {
        let file_io = &self.cfg.file_io;
        let label = call.path.as_str();

        if file_io.chown && !self.cfg.task_runtime.as_user && !running_as_root() {
            let (uid, gid) = invoking_ids();
            match self.backend.normalize_ownership(dir.root(), uid, gid) {
                Ok(()) => debug!("[{}] ownership normalized to {}:{}", label, uid, gid),
                Err(e) => warn!("[{}] failed to normalize ownership: {}", label, e),
            }
        }

        if let Err(e) = apply_cleanup(label, dir, file_io.delete_work, succeeded, file_io.output_hardlinks) {
            warn!("[{}] cleanup failed: {}", label, e);
        }
    }
}

/// Unique container name derived from the call path.
fn container_name(path: &str) -> String {
    let base: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .take(48)
        .collect();
    let suffix: u32 = rand::thread_rng().gen();
    format!("wdlrunner-{}-{:08x}", base, suffix)
}
