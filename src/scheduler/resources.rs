//! Resource Accounting
//!
//! The [`ResourcePool`] tracks total and reserved host cpu/memory. It is
//! owned by the admission controller and only mutated under its lock, so
//! reserve/release pairs never interleave.

use log::{debug, warn};
use sysinfo::System;

use crate::config::{LimitPolicy, SchedulerConfig, TaskRuntimeConfig};
use crate::error::{Result, RunError};
use crate::workflow::ResourceRequest;

/// A cpu/memory amount: a request, a reservation or a capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resources {
    pub cpu: u32,
    /// Bytes
    pub memory: u64,
}

impl Resources {
    pub fn new(cpu: u32, memory: u64) -> Self {
        Self { cpu, memory }
    }
}

/// Total capacity and current reservations.
///
/// Invariant: `reserved <= total` component-wise.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    total: Resources,
    reserved: Resources,
}

impl ResourcePool {
    pub fn new(total: Resources) -> Self {
        Self {
            total,
            reserved: Resources::default(),
        }
    }

    pub fn total(&self) -> Resources {
        self.total
    }

    pub fn reserved(&self) -> Resources {
        self.reserved
    }

    pub fn available(&self) -> Resources {
        Resources {
            cpu: self.total.cpu - self.reserved.cpu,
            memory: self.total.memory - self.reserved.memory,
        }
    }

    /// Whether `request` fits in what is currently available.
    pub fn fits(&self, request: Resources) -> bool {
        let available = self.available();
        request.cpu <= available.cpu && request.memory <= available.memory
    }

    /// Whether `request` could ever fit, with nothing else reserved.
    pub fn satisfiable(&self, request: Resources) -> bool {
        request.cpu <= self.total.cpu && request.memory <= self.total.memory
    }

    /// Reserves `request` if it fits; returns whether it did.
    pub fn try_reserve(&mut self, request: Resources) -> bool {
        if !self.fits(request) {
            return false;
        }
        self.reserved.cpu += request.cpu;
        self.reserved.memory += request.memory;
        true
    }

    /// Returns a reservation previously granted by [`try_reserve`](Self::try_reserve).
    pub fn release(&mut self, request: Resources) {
        self.reserved.cpu = self.reserved.cpu.saturating_sub(request.cpu);
        self.reserved.memory = self.reserved.memory.saturating_sub(request.memory);
    }
}

/// Host capacity: configured overrides, else detected values.
pub fn host_resources(cfg: &SchedulerConfig) -> Resources {
    let cpu = if cfg.host_cpu > 0 {
        cfg.host_cpu
    } else {
        num_cpus::get() as u32
    };

    let memory = if cfg.host_memory > 0 {
        cfg.host_memory
    } else {
        let mut system = System::new();
        system.refresh_memory();
        system.total_memory()
    };

    debug!("Host resources: cpu={} memory={}", cpu, memory);
    Resources { cpu, memory }
}

/// Applies runtime defaults and the cpu/memory maxima to a declared request.
///
/// A maximum of 0 means the host's capacity. Over-limit values are
/// clamped or rejected according to `limit_policy`.
pub fn clamp_request(
    task: &str,
    request: &ResourceRequest,
    runtime: &TaskRuntimeConfig,
    host: Resources,
) -> Result<Resources> {
    let cpu_max = if runtime.cpu_max > 0 {
        runtime.cpu_max
    } else {
        host.cpu
    };
    let memory_max = if runtime.memory_max > 0 {
        runtime.memory_max
    } else {
        host.memory
    };

    let cpu = request.cpu.unwrap_or(runtime.defaults.cpu);
    let memory = request.memory.unwrap_or(runtime.defaults.memory);

    let cpu = limit(task, "cpu", cpu as u64, cpu_max as u64, runtime.limit_policy)? as u32;
    let memory = limit(task, "memory", memory, memory_max, runtime.limit_policy)?;

    Ok(Resources { cpu, memory })
}

fn limit(
    task: &str,
    resource: &'static str,
    requested: u64,
    max: u64,
    policy: LimitPolicy,
) -> Result<u64> {
    if requested <= max {
        return Ok(requested);
    }
    match policy {
        LimitPolicy::Clamp => {
            warn!(
                "Task '{}' requests {}={} which exceeds the maximum {}; clamping",
                task, resource, requested, max
            );
            Ok(max)
        }
        LimitPolicy::Reject => Err(RunError::ResourceUnsatisfiable {
            task: task.to_string(),
            resource,
            requested,
            capacity: max,
        }),
    }
}
