//! Swarm-Mode Backend
//!
//! Runs each task as a one-shot swarm service (`--restart-condition none`)
//! and polls the state of the service's single task. The first backend to
//! be prepared in a process checks the local node's swarm state and, if
//! allowed, initializes a single-node swarm.

use once_cell::sync::OnceCell;

use log::{debug, info, warn};

use super::process::BackendCommand;
use super::state::{ContainerState, ContainerStatus};
use super::{ContainerBackend, ContainerSpec};
use crate::error::{Result, RunError};

/// Swarm readiness, established once per process.
static SWARM_READY: OnceCell<()> = OnceCell::new();

const TASK_FORMAT: &str =
    "{{.Status.State}}|{{if .Status.ContainerStatus}}{{.Status.ContainerStatus.ExitCode}}{{end}}|{{.Status.Err}}";

#[derive(Debug)]
pub struct SwarmBackend {
    command: BackendCommand,
    auto_init: bool,
}

impl SwarmBackend {
    pub fn new(command: BackendCommand, auto_init: bool) -> Self {
        Self { command, auto_init }
    }

    fn ensure_swarm(&self) -> Result<()> {
        let state = self
            .command
            .run(&["info", "--format", "{{.Swarm.LocalNodeState}}"])?;
        debug!("Swarm local node state: {}", state);

        match state.as_str() {
            "active" => Ok(()),
            "inactive" if self.auto_init => {
                info!("Initializing single-node swarm");
                self.command.run(&[
                    "swarm",
                    "init",
                    "--advertise-addr",
                    "127.0.0.1",
                    "--listen-addr",
                    "127.0.0.1",
                ])?;
                Ok(())
            }
            "inactive" => Err(RunError::backend(
                "swarm mode is inactive and container.auto_init_swarm is disabled",
            )),
            other => Err(RunError::backend(format!(
                "swarm node is in state '{}'; expected active",
                other
            ))),
        }
    }
}

/// Builds the arguments of `service create` for `spec`.
pub fn service_args(spec: &ContainerSpec) -> Result<Vec<String>> {
    if spec.privileged {
        return Err(RunError::backend(
            "swarm services cannot run privileged containers",
        ));
    }

    let mut args: Vec<String> = vec![
        "service".into(),
        "create".into(),
        "--detach".into(),
        "--name".into(),
        spec.name.clone(),
        "--restart-condition".into(),
        "none".into(),
        "--label".into(),
        format!("wdlrunner.task={}", spec.task),
        "--workdir".into(),
        spec.workdir.display().to_string(),
    ];

    if spec.cpu > 0 {
        args.push("--reserve-cpu".into());
        args.push(spec.cpu.to_string());
    }
    if spec.memory_reservation > 0 {
        args.push("--reserve-memory".into());
        args.push(spec.memory_reservation.to_string());
    }
    if spec.memory_limit > 0 {
        args.push("--limit-memory".into());
        args.push(spec.memory_limit.to_string());
    }

    for mount in &spec.mounts {
        let mut m = format!(
            "type=bind,source={},destination={}",
            mount.host.display(),
            mount.container.display()
        );
        if mount.read_only {
            m.push_str(",readonly");
        }
        args.push("--mount".into());
        args.push(m);
    }

    for (name, value) in &spec.env {
        args.push("--env".into());
        args.push(format!("{}={}", name, value));
    }
    if let Some(network) = &spec.network {
        args.push("--network".into());
        args.push(network.clone());
    }
    if let Some(user) = &spec.user {
        args.push("--user".into());
        args.push(user.clone());
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    Ok(args)
}

/// Maps a swarm task status line in [`TASK_FORMAT`] to a container status.
pub fn parse_task_status(output: &str) -> Result<ContainerStatus> {
    let mut fields = output.trim().splitn(3, '|');
    let state = fields.next().unwrap_or("");
    let exit_code: Option<i32> = fields.next().and_then(|s| s.trim().parse().ok());
    let err = fields.next().map(str::trim).unwrap_or("");

    let status = match state {
        "new" | "allocated" | "pending" | "assigned" => ContainerStatus::new(ContainerState::Created),
        "accepted" | "preparing" | "ready" | "starting" => {
            ContainerStatus::new(ContainerState::Starting)
        }
        "running" => ContainerStatus::new(ContainerState::Running),
        "complete" => ContainerStatus::exited(exit_code.unwrap_or(0)),
        "failed" => {
            let mut status = ContainerStatus::exited(exit_code.unwrap_or(-1));
            status.state = ContainerState::Failed;
            if !err.is_empty() {
                status = status.with_message(err);
            }
            status
        }
        "shutdown" | "orphaned" | "remove" => {
            ContainerStatus::new(ContainerState::Killed).with_message(format!("swarm task {}", state))
        }
        "rejected" => {
            return Err(RunError::backend(format!("swarm rejected the task: {}", err)));
        }
        other => {
            return Err(RunError::backend(format!(
                "unrecognized swarm task state '{}'",
                other
            )))
        }
    };
    Ok(status)
}

impl ContainerBackend for SwarmBackend {
    fn name(&self) -> &str {
        "swarm"
    }

    fn prepare(&self) -> Result<()> {
        SWARM_READY.get_or_try_init(|| self.ensure_swarm())?;
        Ok(())
    }

    fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let id = self.command.run(&service_args(spec)?)?;
        if id.is_empty() {
            return Err(RunError::backend("service create returned no service id"));
        }
        debug!("Created swarm service {} ({})", spec.name, id);
        Ok(id)
    }

    fn poll(&self, id: &str) -> Result<ContainerStatus> {
        let tasks = self
            .command
            .run(&["service", "ps", "--no-trunc", "--format", "{{.ID}}", id])?;
        let Some(task_id) = tasks.lines().map(str::trim).find(|l| !l.is_empty()) else {
            // not scheduled yet
            return Ok(ContainerStatus::new(ContainerState::Created));
        };

        let output = self.command.run(&["inspect", "--format", TASK_FORMAT, task_id])?;
        parse_task_status(&output)
    }

    fn destroy(&self, id: &str) -> Result<()> {
        match self.command.run(&["service", "rm", id]) {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("not found") => {
                warn!("Swarm service {} already removed", id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
