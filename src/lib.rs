//! WdlRunner - Workflow Task Execution Core
//!
//! Runs the tasks of an evaluated WDL workflow in containers on a single
//! host: admits them against cpu, memory and concurrency limits, stages
//! their inputs, drives the container runtime, links their outputs, and
//! memoizes downloads and task results across runs.
//!
//! # Architecture
//!
//! - [`workflow`]: plan data model (tasks, call graphs, values), loading and validation
//! - [`scheduler`]: admission, cancellation and the run driver
//! - [`container`]: container backends and the polling loop
//! - [`workdir`]: task directories, input staging, output links, cleanup
//! - [`cache`]: download cache and call cache
//! - [`monitoring`]: run timeline
//! - [`config`], [`error`]: configuration surface and error taxonomy
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use wdlrunner::{load_plan, Config, Scheduler};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Defaults, then WDLRUNNER__* environment overrides
//!     let cfg = Config::load(None)?;
//!     let plan = load_plan("plan.yaml", cfg.file_io.use_relative_output_paths)?;
//!
//!     let scheduler = Scheduler::new(cfg)?;
//!     let outcome = scheduler.run_workflow(&plan, Path::new("/data/runs"))?;
//!
//!     let (dir, outputs) = outcome.into_result()?;
//!     println!("{} outputs under {}", outputs.len(), dir.display());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod container;
pub mod error;
pub mod monitoring;
pub mod scheduler;
pub mod workdir;
pub mod workflow;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, RunError};
pub use scheduler::{CancelToken, RunOutcome, Scheduler};
pub use workflow::{load_plan, Task, Value, WorkflowSpec};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "wdlrunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "wdlrunner");
    }

    #[test]
    fn test_module_exports_task() {
        let task = Task::new("hello", "echo hi").with_input("n", Value::Int(1));
        assert_eq!(task.name, "hello");
        assert_eq!(task.inputs["n"], Value::Int(1));
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = WorkflowSpec::new("wf");
        assert!(workflow.calls.is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
