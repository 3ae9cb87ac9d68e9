//! CLI Engine Backend
//!
//! Drives docker-compatible engines (`docker`, `podman`) through their
//! command-line interface: `create` + `start`, `inspect` to poll, and
//! `rm -f` to tear down.

use std::path::Path;

use log::{debug, info, warn};

use super::process::BackendCommand;
use super::state::{ContainerState, ContainerStatus};
use super::{ContainerBackend, ContainerSpec};
use crate::error::{Result, RunError};

/// Image used for the ownership fix-up helper container.
const CHOWN_IMAGE: &str = "alpine:3";

const INSPECT_FORMAT: &str = "{{.State.Status}}|{{.State.ExitCode}}|{{.State.OOMKilled}}";

#[derive(Debug)]
pub struct CliBackend {
    name: String,
    command: BackendCommand,
}

impl CliBackend {
    pub fn new(name: impl Into<String>, command: BackendCommand) -> Self {
        Self {
            name: name.into(),
            command,
        }
    }
}

/// Builds the arguments of `create` for `spec`.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "create".into(),
        "--name".into(),
        spec.name.clone(),
        "--label".into(),
        format!("wdlrunner.task={}", spec.task),
        "--workdir".into(),
        spec.workdir.display().to_string(),
    ];

    if spec.cpu > 0 {
        args.push("--cpus".into());
        args.push(spec.cpu.to_string());
    }
    if spec.memory_reservation > 0 {
        args.push("--memory-reservation".into());
        args.push(spec.memory_reservation.to_string());
    }
    if spec.memory_limit > 0 {
        args.push("--memory".into());
        args.push(spec.memory_limit.to_string());
    }

    for mount in &spec.mounts {
        let mut volume = format!("{}:{}", mount.host.display(), mount.container.display());
        if mount.read_only {
            volume.push_str(":ro");
        }
        args.push("-v".into());
        args.push(volume);
    }

    for (name, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{}={}", name, value));
    }

    if let Some(network) = &spec.network {
        args.push("--network".into());
        args.push(network.clone());
    }
    if spec.privileged {
        args.push("--privileged".into());
    }
    if let Some(user) = &spec.user {
        args.push("--user".into());
        args.push(user.clone());
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Parses `inspect` output in [`INSPECT_FORMAT`].
pub fn parse_inspect(output: &str) -> Result<ContainerStatus> {
    let mut fields = output.trim().split('|');
    let status = fields.next().unwrap_or("");
    let exit_code: i32 = fields.next().and_then(|s| s.trim().parse().ok()).unwrap_or(-1);
    let oom_killed = fields.next().map(|s| s.trim() == "true").unwrap_or(false);

    let parsed = match status {
        "created" => ContainerStatus::new(ContainerState::Created),
        "restarting" => ContainerStatus::new(ContainerState::Starting),
        "running" | "paused" | "removing" => ContainerStatus::new(ContainerState::Running),
        "exited" | "dead" | "stopped" => {
            let mut status = ContainerStatus::exited(exit_code);
            if oom_killed {
                status.state = ContainerState::Failed;
                status = status.with_message("container was killed for exceeding its memory limit");
            }
            status
        }
        other => {
            return Err(RunError::backend(format!(
                "unrecognized container status '{}'",
                other
            )))
        }
    };
    Ok(parsed)
}

fn is_missing(err: &RunError) -> bool {
    let text = err.to_string();
    text.contains("No such container") || text.contains("no such container")
}

impl ContainerBackend for CliBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let id = self.command.run(&create_args(spec))?;
        if id.is_empty() {
            return Err(RunError::backend(format!(
                "{} create returned no container id",
                self.command.executable()
            )));
        }
        debug!("Created container {} ({})", spec.name, id);

        if let Err(e) = self.command.run(&["start", id.as_str()]) {
            // a container that never started must not leak
            if let Err(rm) = self.command.run(&["rm", "-f", id.as_str()]) {
                warn!("Failed to remove unstarted container {}: {}", id, rm);
            }
            return Err(e);
        }
        Ok(id)
    }

    fn poll(&self, id: &str) -> Result<ContainerStatus> {
        let output = self.command.run(&["inspect", "--format", INSPECT_FORMAT, id])?;
        parse_inspect(&output)
    }

    fn destroy(&self, id: &str) -> Result<()> {
        match self.command.run(&["rm", "-f", id]) {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn normalize_ownership(&self, dir: &Path, uid: u32, gid: u32) -> Result<()> {
        info!("Re-owning {} to {}:{}", dir.display(), uid, gid);
        let volume = format!("{}:/mnt/chown", dir.display());
        let owner = format!("{}:{}", uid, gid);
        self.command.run(&[
            "run",
            "--rm",
            "--user",
            "0:0",
            "-v",
            volume.as_str(),
            CHOWN_IMAGE,
            "chown",
            "-RP",
            owner.as_str(),
            "/mnt/chown",
        ])?;
        Ok(())
    }
}
