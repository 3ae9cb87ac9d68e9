//! Container Backends
//!
//! A [`ContainerBackend`] creates, polls and destroys containers on some
//! runtime. The built-in set is closed and enumerated by [`BackendKind`];
//! implementations supplied by embedding code are added through a
//! [`BackendRegistry`].
//!
//! # Architecture
//!
//! - [`state`]: lifecycle state machine and the per-task handle
//! - [`poll`]: jittered polling loop with bounded transient retries
//! - [`process`]: invocation of the backend executable
//! - [`cli`]: docker/podman style engines
//! - [`swarm`]: swarm-mode services

pub mod cli;
pub mod poll;
pub mod process;
pub mod state;
pub mod swarm;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use crate::config::ContainerConfig;
use crate::error::{Result, RunError};
use crate::workdir::cleanup::chown_tree;

pub use poll::{drive, jittered, PollSettings};
pub use state::{ContainerHandle, ContainerState, ContainerStatus};

/// A bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: PathBuf,
    pub read_only: bool,
}

impl Mount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only,
        }
    }
}

/// Everything a backend needs to create one task container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique container name
    pub name: String,
    /// Task name, for logs and labels
    pub task: String,
    pub image: String,
    pub command: Vec<String>,
    /// Working directory inside the container
    pub workdir: PathBuf,
    pub cpu: u32,
    /// Bytes; 0 = none
    pub memory_reservation: u64,
    /// Hard limit in bytes; 0 = none
    pub memory_limit: u64,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
    pub network: Option<String>,
    pub privileged: bool,
    /// `uid:gid` to run as
    pub user: Option<String>,
}

impl ContainerSpec {
    /// Host directory mounted at `container_path`, if any.
    pub fn host_path(&self, container_path: &Path) -> Option<&Path> {
        self.mounts
            .iter()
            .find(|m| m.container == container_path)
            .map(|m| m.host.as_path())
    }
}

/// Capability set of a container runtime.
pub trait ContainerBackend: Send + Sync {
    fn name(&self) -> &str;

    /// One-time, idempotent setup; called once per scheduler.
    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Creates and starts a container, returning its backend id.
    fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Queries the current status of a container.
    fn poll(&self, id: &str) -> Result<ContainerStatus>;

    /// Stops (if needed) and removes a container. Removing a missing
    /// container is not an error.
    fn destroy(&self, id: &str) -> Result<()>;

    /// Re-owns `dir` recursively to `uid:gid`.
    fn normalize_ownership(&self, dir: &Path, uid: u32, gid: u32) -> Result<()> {
        chown_tree(dir, uid, gid)
    }
}

/// Built-in backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Docker,
    Podman,
    Swarm,
}

impl BackendKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "docker" => Some(Self::Docker),
            "podman" => Some(Self::Podman),
            "swarm" | "docker_swarm" => Some(Self::Swarm),
            _ => None,
        }
    }

    pub fn default_executable(self) -> &'static str {
        match self {
            Self::Docker | Self::Swarm => "docker",
            Self::Podman => "podman",
        }
    }

    /// Instantiates the backend for `cfg`.
    pub fn build(self, cfg: &ContainerConfig) -> Arc<dyn ContainerBackend> {
        let executable = if cfg.executable.is_empty() {
            self.default_executable().to_string()
        } else {
            cfg.executable.clone()
        };
        let command = process::BackendCommand::new(executable, cfg.flags.clone());

        match self {
            Self::Docker | Self::Podman => Arc::new(cli::CliBackend::new(self.to_string(), command)),
            Self::Swarm => Arc::new(swarm::SwarmBackend::new(command, cfg.auto_init_swarm)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
            Self::Swarm => "swarm",
        };
        write!(f, "{}", name)
    }
}

/// Constructor of an externally supplied backend.
pub type BackendFactory = Box<dyn Fn(&ContainerConfig) -> Result<Arc<dyn ContainerBackend>> + Send + Sync>;

/// Backends registered by embedding code, looked up after the built-ins.
#[derive(Default)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend under `name`. Built-in names cannot be shadowed.
    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) -> Result<()> {
        let name = name.into();
        if BackendKind::parse(&name).is_some() {
            return Err(RunError::Config(format!(
                "container backend '{}' is built in and cannot be replaced",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Builds the backend selected by `cfg.backend`.
    pub fn build(&self, cfg: &ContainerConfig) -> Result<Arc<dyn ContainerBackend>> {
        if let Some(kind) = BackendKind::parse(&cfg.backend) {
            info!("Using built-in container backend: {}", kind);
            return Ok(kind.build(cfg));
        }
        match self.factories.get(&cfg.backend) {
            Some(factory) => {
                info!("Using registered container backend: {}", cfg.backend);
                factory(cfg)
            }
            None => {
                let mut known: Vec<&str> = vec!["docker", "podman", "swarm"];
                known.extend(self.factories.keys().map(String::as_str));
                Err(RunError::Config(format!(
                    "unknown container backend '{}' (available: {})",
                    cfg.backend,
                    known.join(", ")
                )))
            }
        }
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
