//! Plan Parser
//!
//! Loads execution plans from YAML files and validates them.

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::WorkflowSpec;
use super::validator::validate_plan;
use crate::error::{Result, RunError};

/// Loads a plan from a YAML file.
///
/// This function:
/// 1. Reads and parses the YAML file
/// 2. Validates the call graph and output declarations
///
/// # Arguments
///
/// * `path` - Path to the plan YAML file
/// * `relative_outputs` - Whether outputs use the relative `out/` layout
///
/// # Example
///
/// ```rust,no_run
/// use wdlrunner::workflow::load_plan;
///
/// fn main() -> Result<(), wdlrunner::RunError> {
///     let plan = load_plan("plan.yaml", false)?;
///     println!("Loaded {} calls", plan.calls.len());
///     Ok(())
/// }
/// ```
pub fn load_plan(path: impl AsRef<Path>, relative_outputs: bool) -> Result<WorkflowSpec> {
    let path = path.as_ref();
    info!("Loading plan from: {}", path.display());

    let text = fs::read_to_string(path).map_err(|e| RunError::io(path, e))?;
    debug!("YAML content loaded ({} bytes)", text.len());

    parse_plan(&text, relative_outputs)
}

/// Parses and validates a plan from YAML text.
pub fn parse_plan(text: &str, relative_outputs: bool) -> Result<WorkflowSpec> {
    let workflow: WorkflowSpec = serde_yaml::from_str(text)
        .map_err(|e| RunError::Plan(format!("failed to parse plan YAML: {}", e)))?;

    info!(
        "Parsed workflow '{}' with {} top-level calls",
        workflow.name,
        workflow.calls.len()
    );

    validate_plan(&workflow, relative_outputs)?;
    Ok(workflow)
}
