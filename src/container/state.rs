//! Container Lifecycle State Machine
//!
//! ```text
//! Created -> Starting -> Running -> {Succeeded | Failed | Killed} -> Reaped
//! ```
//!
//! `Killed` is reachable from every pre-terminal state. Backends may skip
//! intermediate states between two polls; [`ContainerHandle::observe`]
//! records the skipped states so the history is always a valid path.

use std::fmt;

use log::debug;
use serde::Serialize;

use crate::error::{Result, RunError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ContainerState {
    Created,
    Starting,
    Running,
    Succeeded,
    Failed,
    Killed,
    Reaped,
}

impl ContainerState {
    /// Succeeded, Failed or Killed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Killed)
    }

    pub fn is_pre_terminal(self) -> bool {
        matches!(self, Self::Created | Self::Starting | Self::Running)
    }

    /// Position along the main path; terminal states share a rank.
    fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Succeeded | Self::Failed | Self::Killed => 3,
            Self::Reaped => 4,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Returns true if `src -> dst` is a single legal step.
pub fn valid_transition(src: ContainerState, dst: ContainerState) -> bool {
    use ContainerState::*;

    matches!(
        (src, dst),
        (Created, Starting)
            | (Starting, Running)
            | (Running, Succeeded | Failed)
            | (Created | Starting | Running, Killed)
            | (Succeeded | Failed | Killed, Reaped)
    )
}

/// One status observation from a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub exit_status: Option<i32>,
    /// Backend-supplied detail, e.g. an OOM kill
    pub message: Option<String>,
}

impl ContainerStatus {
    pub fn new(state: ContainerState) -> Self {
        Self {
            state,
            exit_status: None,
            message: None,
        }
    }

    pub fn exited(exit_status: i32) -> Self {
        let state = if exit_status == 0 {
            ContainerState::Succeeded
        } else {
            ContainerState::Failed
        };
        Self {
            state,
            exit_status: Some(exit_status),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A backend container owned by one task's worker.
#[derive(Debug)]
pub struct ContainerHandle {
    /// Backend-assigned identifier
    pub id: String,
    /// Run identifier of the owning task, for logs
    pub label: String,
    state: ContainerState,
    exit_status: Option<i32>,
    message: Option<String>,
    /// Transient backend errors retried so far
    pub transient_retries: u32,
    history: Vec<ContainerState>,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            state: ContainerState::Created,
            exit_status: None,
            message: None,
            transient_retries: 0,
            history: vec![ContainerState::Created],
        }
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn history(&self) -> &[ContainerState] {
        &self.history
    }

    fn step(&mut self, dst: ContainerState) {
        debug_assert!(valid_transition(self.state, dst), "{} -> {}", self.state, dst);
        debug!("[{}] container {} {} -> {}", self.label, self.id, self.state, dst);
        self.state = dst;
        self.history.push(dst);
    }

    /// Applies a polled status, filling in skipped intermediate states.
    ///
    /// Observations that would move backwards are ignored; a terminal
    /// state is never left except by [`reap`](Self::reap).
    pub fn observe(&mut self, status: &ContainerStatus) -> Result<()> {
        let dst = status.state;
        if dst == ContainerState::Reaped {
            return Err(RunError::backend(format!(
                "container {} reported as reaped before exit",
                self.id
            )));
        }
        if dst.rank() <= self.state.rank() {
            if dst != self.state {
                debug!(
                    "[{}] ignoring stale observation {} in state {}",
                    self.label, dst, self.state
                );
            }
            return Ok(());
        }

        // Killed is a direct step from any pre-terminal state
        if dst != ContainerState::Killed {
            for intermediate in [ContainerState::Starting, ContainerState::Running] {
                if intermediate.rank() > self.state.rank() && intermediate.rank() < dst.rank() {
                    self.step(intermediate);
                }
            }
        }
        self.step(dst);

        if status.exit_status.is_some() {
            self.exit_status = status.exit_status;
        }
        if status.message.is_some() {
            self.message = status.message.clone();
        }
        Ok(())
    }

    /// Marks a cancelled container. No-op once terminal.
    pub fn kill(&mut self) {
        if self.state.is_pre_terminal() {
            self.step(ContainerState::Killed);
        }
    }

    /// Marks a terminal container as removed.
    pub fn reap(&mut self) {
        if self.state.is_terminal() {
            self.step(ContainerState::Reaped);
        }
    }
}
