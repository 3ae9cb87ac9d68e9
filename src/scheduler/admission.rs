//! Admission Control
//!
//! Grants concurrency slots and resource reservations. A waiter is admitted
//! when a slot is free in its pool and, for tasks, the [`ResourcePool`] can
//! hold its request. Waiters are served in arrival order among those that
//! currently fit, so a large request does not block smaller ones that can
//! run now.
//!
//! # Pools
//!
//! - `Task`: running containers, sized by `task_concurrency`
//! - `Download`: running downloads, sized independently
//! - `Subworkflow(depth)`: one pool per nesting depth

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;

use super::cancel::CancelToken;
use super::resources::{ResourcePool, Resources};
use crate::config::SchedulerConfig;
use crate::error::{Result, RunError};

/// Upper bound on how long a waiter sleeps before re-checking cancellation.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Concurrency pool a lease is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Task,
    Download,
    Subworkflow(usize),
}

/// Slot counts per pool.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub tasks: usize,
    pub downloads: usize,
    pub subworkflows: usize,
}

impl Limits {
    /// Resolves configured sizes, where 0 means a derived default.
    pub fn from_config(cfg: &SchedulerConfig, host: Resources) -> Self {
        let tasks = if cfg.task_concurrency > 0 {
            cfg.task_concurrency
        } else {
            (host.cpu as usize).max(1)
        };
        let subworkflows = if cfg.subworkflow_concurrency > 0 {
            cfg.subworkflow_concurrency
        } else {
            tasks
        };
        Self {
            tasks,
            downloads: cfg.download_concurrency.max(1),
            subworkflows,
        }
    }
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    kind: PoolKind,
    request: Resources,
}

#[derive(Debug)]
struct State {
    pool: ResourcePool,
    running: HashMap<PoolKind, usize>,
    peak: HashMap<PoolKind, usize>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

impl State {
    fn running(&self, kind: PoolKind) -> usize {
        self.running.get(&kind).copied().unwrap_or(0)
    }
}

/// Point-in-time view of admission state.
#[derive(Debug, Clone, Default)]
pub struct AdmissionSnapshot {
    pub running_tasks: usize,
    pub running_downloads: usize,
    pub peak_tasks: usize,
    pub peak_downloads: usize,
    pub reserved: Resources,
    pub waiting: usize,
}

/// Shared admission controller, one per scheduler.
#[derive(Debug)]
pub struct Admission {
    limits: Limits,
    state: Mutex<State>,
    cvar: Condvar,
}

impl Admission {
    pub fn new(limits: Limits, total: Resources) -> Arc<Self> {
        debug!(
            "Admission pools: tasks={} downloads={} subworkflows/depth={} total cpu={} memory={}",
            limits.tasks, limits.downloads, limits.subworkflows, total.cpu, total.memory
        );
        Arc::new(Self {
            limits,
            state: Mutex::new(State {
                pool: ResourcePool::new(total),
                running: HashMap::new(),
                peak: HashMap::new(),
                queue: VecDeque::new(),
                next_ticket: 0,
            }),
            cvar: Condvar::new(),
        })
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn capacity(&self, kind: PoolKind) -> usize {
        match kind {
            PoolKind::Task => self.limits.tasks,
            PoolKind::Download => self.limits.downloads,
            PoolKind::Subworkflow(_) => self.limits.subworkflows,
        }
    }

    fn admissible(&self, state: &State, waiter: &Waiter) -> bool {
        state.running(waiter.kind) < self.capacity(waiter.kind) && state.pool.fits(waiter.request)
    }

    /// Blocks until a slot in `kind` and `request` are granted.
    ///
    /// Returns `Ok(None)` if `cancel` fires while waiting. A task request
    /// that exceeds total capacity fails immediately with
    /// `ResourceUnsatisfiable`.
    pub fn acquire(
        self: &Arc<Self>,
        label: &str,
        kind: PoolKind,
        request: Resources,
        cancel: &CancelToken,
    ) -> Result<Option<Lease>> {
        let mut state = self.lock();

        let total = state.pool.total();
        if request.cpu > total.cpu {
            return Err(RunError::ResourceUnsatisfiable {
                task: label.to_string(),
                resource: "cpu",
                requested: request.cpu as u64,
                capacity: total.cpu as u64,
            });
        }
        if request.memory > total.memory {
            return Err(RunError::ResourceUnsatisfiable {
                task: label.to_string(),
                resource: "memory",
                requested: request.memory,
                capacity: total.memory,
            });
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(Waiter {
            ticket,
            kind,
            request,
        });

        loop {
            if cancel.is_cancelled() {
                state.queue.retain(|w| w.ticket != ticket);
                self.cvar.notify_all();
                debug!("{} stopped waiting for admission: cancelled", label);
                return Ok(None);
            }

            let first = state
                .queue
                .iter()
                .find(|w| self.admissible(&state, w))
                .map(|w| w.ticket);

            if first == Some(ticket) {
                state.queue.retain(|w| w.ticket != ticket);
                state.pool.try_reserve(request);
                let running = state.running.entry(kind).or_insert(0);
                *running += 1;
                let now = *running;
                let peak = state.peak.entry(kind).or_insert(0);
                *peak = (*peak).max(now);

                // others behind us may fit in what is left
                self.cvar.notify_all();
                debug!(
                    "{} admitted to {:?} pool (cpu={} memory={})",
                    label, kind, request.cpu, request.memory
                );
                return Ok(Some(Lease {
                    admission: Arc::clone(self),
                    kind,
                    resources: request,
                }));
            }

            let (guard, _) = self
                .cvar
                .wait_timeout(state, WAIT_SLICE)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    fn release(&self, kind: PoolKind, resources: Resources) {
        let mut state = self.lock();
        state.pool.release(resources);
        if let Some(running) = state.running.get_mut(&kind) {
            *running = running.saturating_sub(1);
        }
        self.cvar.notify_all();
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let state = self.lock();
        AdmissionSnapshot {
            running_tasks: state.running(PoolKind::Task),
            running_downloads: state.running(PoolKind::Download),
            peak_tasks: state.peak.get(&PoolKind::Task).copied().unwrap_or(0),
            peak_downloads: state.peak.get(&PoolKind::Download).copied().unwrap_or(0),
            reserved: state.pool.reserved(),
            waiting: state.queue.len(),
        }
    }
}

/// A granted slot and reservation; released on drop.
#[derive(Debug)]
pub struct Lease {
    admission: Arc<Admission>,
    kind: PoolKind,
    resources: Resources,
}

impl Lease {
    pub fn resources(&self) -> Resources {
        self.resources
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.admission.release(self.kind, self.resources);
    }
}
