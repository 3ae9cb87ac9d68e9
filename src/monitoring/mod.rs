//! Run Monitoring Module
//!
//! Tracks when each call of a run was queued, started and finished.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: per-call events, outcome counts and Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent, TimelineSummary};
