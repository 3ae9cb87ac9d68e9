//! Scheduling and Execution
//!
//! # Architecture
//!
//! - [`engine`]: the [`Scheduler`], run directories and call graph traversal
//! - `task`: the lifecycle of one task instance
//! - [`admission`]: concurrency pools and resource reservations
//! - [`resources`]: host capacity and request clamping
//! - [`cancel`]: cooperative cancellation
//! - [`scatter`]: run identifiers of scatter instances

pub mod admission;
pub mod cancel;
pub mod engine;
pub mod resources;
pub mod scatter;
mod task;

pub use admission::{Admission, AdmissionSnapshot, Lease, Limits, PoolKind};
pub use cancel::CancelToken;
pub use engine::{RunContext, RunOutcome, Scheduler, TaskCall, TaskOutcome};
pub use resources::{clamp_request, host_resources, Resources};
pub use scatter::scatter_tag;
