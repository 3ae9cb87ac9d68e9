//! Error Taxonomy
//!
//! Every fallible operation in the execution core returns [`RunError`].
//! Per-task errors are attached to that task's outcome and aggregated
//! into [`RunError::RunFailed`] at the run level. A stale cache entry is
//! a miss, never an error.

use std::io;
use std::path::{Path, PathBuf};

use serde_json::json;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RunError>;

/// Errors raised while scheduling, executing or caching tasks.
#[derive(Debug, Error)]
pub enum RunError {
    /// The clamped requirement exceeds what the host can ever provide.
    #[error("task '{task}' requests {resource}={requested} but the limit is {capacity}")]
    ResourceUnsatisfiable {
        task: String,
        resource: &'static str,
        requested: u64,
        capacity: u64,
    },

    /// The container backend failed; transient errors are retried by the poll loop.
    #[error("container backend error{}: {message}", if *.transient { " (transient)" } else { "" })]
    Backend { message: String, transient: bool },

    /// The task's command exited non-zero.
    #[error("task '{task}' command failed with exit status {exit_status} (see {})", .stderr.display())]
    CommandFailed {
        task: String,
        exit_status: i32,
        stderr: PathBuf,
    },

    /// The task was cancelled before or while running.
    #[error("task '{task}' was interrupted")]
    Interrupted { task: String },

    /// A referenced path resolves outside the configured root.
    #[error("path '{}' is outside the configured root '{}'", .path.display(), .root.display())]
    PathConfinement { path: PathBuf, root: PathBuf },

    /// Two outputs would be linked at the same location.
    #[error("output '{output}' collides with '{existing}' at '{}'", .path.display())]
    NamingCollision {
        path: PathBuf,
        output: String,
        existing: String,
    },

    /// The requested container network is not allow-listed.
    #[error("task '{task}' requested network '{network}' which is not in the allow-list")]
    NetworkRejected { task: String, network: String },

    /// A declared, non-optional output was not produced.
    #[error("task '{task}' did not produce output '{output}' at '{}'", .path.display())]
    MissingOutput {
        task: String,
        output: String,
        path: PathBuf,
    },

    #[error("download of '{uri}' failed: {message}")]
    Download { uri: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid plan: {0}")]
    Plan(String),

    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// Aggregate outcome of a run in which at least one task failed.
    #[error("run failed: {failed} task(s) failed, first at '{call}': {cause}")]
    RunFailed {
        failed: usize,
        call: String,
        #[source]
        cause: Box<RunError>,
    },
}

impl RunError {
    /// Wraps an I/O error with the path it concerns.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            transient: true,
        }
    }

    /// Returns true for backend errors worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend { transient: true, .. })
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResourceUnsatisfiable { .. } => "ResourceUnsatisfiable",
            Self::Backend { .. } => "ContainerBackendError",
            Self::CommandFailed { .. } => "CommandFailed",
            Self::Interrupted { .. } => "Interrupted",
            Self::PathConfinement { .. } => "PathConfinementViolation",
            Self::NamingCollision { .. } => "NamingCollision",
            Self::NetworkRejected { .. } => "BackendNetworkRejected",
            Self::MissingOutput { .. } => "MissingOutput",
            Self::Download { .. } => "DownloadFailed",
            Self::Config(_) => "ConfigurationError",
            Self::Plan(_) => "InvalidPlan",
            Self::Io { .. } => "IOError",
            Self::Json(_) | Self::Yaml(_) => "SerializationError",
            Self::RunFailed { .. } => "RunFailed",
        }
    }

    /// Innermost cause, looking through run-level aggregation.
    pub fn root_cause(&self) -> &RunError {
        match self {
            Self::RunFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Process exit status appropriate for this error.
    pub fn exit_status(&self) -> i32 {
        match self.root_cause() {
            Self::CommandFailed { exit_status, .. } if *exit_status != 0 => *exit_status,
            _ => 2,
        }
    }

    /// Renders the error as a JSON object for machine consumers.
    pub fn to_json(&self) -> serde_json::Value {
        let mut info = json!({
            "error": self.root_cause().kind(),
            "message": self.to_string(),
        });
        if let Self::CommandFailed {
            exit_status,
            stderr,
            ..
        } = self.root_cause()
        {
            info["exit_status"] = json!(exit_status);
            info["stderr_file"] = json!(stderr);
        }
        if let Self::RunFailed { call, failed, .. } = self {
            info["call"] = json!(call);
            info["failed"] = json!(failed);
        }
        info
    }
}
