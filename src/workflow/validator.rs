//! Plan Validation
//!
//! Checks performed before anything runs:
//! - Call fields (ids, task names, commands, output paths)
//! - Reference integrity of `after` lists
//! - Dependency graph is acyclic (Kahn's algorithm)
//! - Under the relative output layout, no two task instances declare
//!   the same output path

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Component, Path, PathBuf};

use log::{debug, info};

use super::model::{CallBody, CallNode, Task, WorkflowSpec};
use crate::error::{Result, RunError};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflow,
    EmptyCallId(String),
    DuplicateCallId(String),
    EmptyTaskName(String),
    EmptyCommand(String),
    EmptyScatterVariable(String),
    InvalidReference { call: String, reference: String },
    CyclicDependency(String),
    InvalidOutputPath { call: String, output: String, path: String },
    DuplicateOutputName { call: String, output: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow has no calls"),
            Self::EmptyCallId(scope) => write!(f, "A call in '{}' has an empty id", scope),
            Self::DuplicateCallId(id) => write!(f, "Duplicate call ID: '{}'", id),
            Self::EmptyTaskName(call) => write!(f, "Call '{}' has a task with no name", call),
            Self::EmptyCommand(call) => write!(f, "Call '{}' has no command specified", call),
            Self::EmptyScatterVariable(call) => {
                write!(f, "Scatter '{}' does not name its variable", call)
            }
            Self::InvalidReference { call, reference } => {
                write!(f, "Call '{}' references unknown call '{}'", call, reference)
            }
            Self::CyclicDependency(scope) => {
                write!(f, "Workflow '{}' contains cyclic dependencies", scope)
            }
            Self::InvalidOutputPath { call, output, path } => write!(
                f,
                "Call '{}': output '{}' path '{}' must be relative without '..'",
                call, output, path
            ),
            Self::DuplicateOutputName { call, output } => {
                write!(f, "Call '{}' declares output '{}' twice", call, output)
            }
        }
    }
}

impl From<ValidationError> for RunError {
    fn from(e: ValidationError) -> Self {
        RunError::Plan(e.to_string())
    }
}

/// Validates a plan.
///
/// With `relative_outputs`, output paths that would alias each other
/// under the run's `out/` tree fail with `NamingCollision`.
pub fn validate_plan(workflow: &WorkflowSpec, relative_outputs: bool) -> Result<()> {
    info!(
        "Validating workflow '{}' with {} calls",
        workflow.name,
        workflow.calls.len()
    );

    if workflow.calls.is_empty() {
        return Err(ValidationError::EmptyWorkflow.into());
    }

    let mut errors = Vec::new();
    validate_calls(&workflow.name, &workflow.calls, &mut errors);
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(RunError::Plan(messages.join("\n")));
    }

    if relative_outputs {
        let mut claims: HashMap<PathBuf, String> = HashMap::new();
        check_relative_outputs("", &workflow.calls, 1, &mut claims)?;
    }

    info!("Workflow '{}' validated", workflow.name);
    Ok(())
}

fn validate_calls(scope: &str, calls: &[CallNode], errors: &mut Vec<ValidationError>) {
    let mut seen: HashSet<&str> = HashSet::new();
    for node in calls {
        if node.id.trim().is_empty() {
            errors.push(ValidationError::EmptyCallId(scope.to_string()));
            continue;
        }
        if !seen.insert(&node.id) {
            errors.push(ValidationError::DuplicateCallId(node.id.clone()));
        }
    }

    for node in calls {
        for reference in &node.after {
            if !seen.contains(reference.as_str()) {
                errors.push(ValidationError::InvalidReference {
                    call: node.id.clone(),
                    reference: reference.clone(),
                });
            }
        }
        validate_body(&node.id, &node.call, errors);
    }

    if errors.is_empty() && execution_order(calls).is_err() {
        errors.push(ValidationError::CyclicDependency(scope.to_string()));
    }
}

fn validate_body(call: &str, body: &CallBody, errors: &mut Vec<ValidationError>) {
    match body {
        CallBody::Task(task) => validate_task(call, task, errors),
        CallBody::Workflow(wf) => validate_calls(&wf.name, &wf.calls, errors),
        CallBody::Scatter(scatter) => {
            if scatter.variable.trim().is_empty() {
                errors.push(ValidationError::EmptyScatterVariable(call.to_string()));
            }
            validate_body(call, &scatter.body, errors);
        }
    }
}

fn validate_task(call: &str, task: &Task, errors: &mut Vec<ValidationError>) {
    if task.name.trim().is_empty() {
        errors.push(ValidationError::EmptyTaskName(call.to_string()));
    }
    if task.command.trim().is_empty() {
        errors.push(ValidationError::EmptyCommand(call.to_string()));
    }

    let mut names = HashSet::new();
    for output in &task.outputs {
        if !names.insert(&output.name) {
            errors.push(ValidationError::DuplicateOutputName {
                call: call.to_string(),
                output: output.name.clone(),
            });
        }
        if !is_clean_relative(&output.path) {
            errors.push(ValidationError::InvalidOutputPath {
                call: call.to_string(),
                output: output.name.clone(),
                path: output.path.clone(),
            });
        }
    }
}

/// Returns true for a non-empty relative path with no `..` components.
pub fn is_clean_relative(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Claims every relative output path, multiplied by the scatter widths above it.
fn check_relative_outputs(
    prefix: &str,
    calls: &[CallNode],
    multiplicity: usize,
    claims: &mut HashMap<PathBuf, String>,
) -> Result<()> {
    for node in calls {
        let path = if prefix.is_empty() {
            node.id.clone()
        } else {
            format!("{}.{}", prefix, node.id)
        };
        check_body(&path, &node.call, multiplicity, claims)?;
    }
    Ok(())
}

fn check_body(
    path: &str,
    body: &CallBody,
    multiplicity: usize,
    claims: &mut HashMap<PathBuf, String>,
) -> Result<()> {
    match body {
        CallBody::Task(task) => {
            if multiplicity == 0 {
                return Ok(());
            }
            for output in &task.outputs {
                let dest = Path::new("out").join(&output.path);
                let label = format!("{}.{}", path, output.name);
                if multiplicity > 1 {
                    return Err(RunError::NamingCollision {
                        path: dest,
                        output: label.clone(),
                        existing: label,
                    });
                }
                if let Some(existing) = claims.get(&dest) {
                    return Err(RunError::NamingCollision {
                        path: dest,
                        output: label,
                        existing: existing.clone(),
                    });
                }
                debug!("Claimed relative output {} for {}", dest.display(), label);
                claims.insert(dest, label);
            }
            Ok(())
        }
        CallBody::Workflow(wf) => check_relative_outputs(path, &wf.calls, multiplicity, claims),
        CallBody::Scatter(scatter) => check_body(
            path,
            &scatter.body,
            multiplicity * scatter.items.len(),
            claims,
        ),
    }
}

/// Orders sibling calls so that dependencies come first (Kahn's algorithm).
///
/// Returns indices into `calls`; fails when the graph has a cycle.
pub fn execution_order(calls: &[CallNode]) -> std::result::Result<Vec<usize>, ValidationError> {
    let index: HashMap<&str, usize> = calls
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; calls.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); calls.len()];
    for (i, node) in calls.iter().enumerate() {
        for reference in &node.after {
            if let Some(&dep) = index.get(reference.as_str()) {
                in_degree[i] += 1;
                successors[dep].push(i);
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..calls.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(calls.len());

    while let Some(current) = queue.pop_front() {
        order.push(current);
        for &next in &successors[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() != calls.len() {
        return Err(ValidationError::CyclicDependency(String::new()));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{OutputDecl, Scatter};
    use crate::workflow::value::Value;

    fn task_call(id: &str, output: &str) -> CallNode {
        CallNode::task(
            id,
            Task::new(id, "echo hi > out").with_output(OutputDecl::file("out", output)),
        )
    }

    #[test]
    fn test_empty_workflow() {
        let err = validate_plan(&WorkflowSpec::new("wf"), false).unwrap_err();
        assert!(matches!(err, RunError::Plan(_)));
    }

    #[test]
    fn test_duplicate_call_id() {
        let wf = WorkflowSpec::new("wf")
            .with_call(task_call("a", "x.txt"))
            .with_call(task_call("a", "y.txt"));
        let err = validate_plan(&wf, false).unwrap_err();
        assert!(err.to_string().contains("Duplicate call ID"));
    }

    #[test]
    fn test_invalid_reference() {
        let wf = WorkflowSpec::new("wf").with_call(task_call("a", "x.txt").depends_on("ghost"));
        let err = validate_plan(&wf, false).unwrap_err();
        assert!(err.to_string().contains("unknown call 'ghost'"));
    }

    #[test]
    fn test_cycle_detected() {
        let wf = WorkflowSpec::new("wf")
            .with_call(task_call("a", "x.txt").depends_on("b"))
            .with_call(task_call("b", "y.txt").depends_on("a"));
        let err = validate_plan(&wf, false).unwrap_err();
        assert!(err.to_string().contains("cyclic"));
    }

    #[test]
    fn test_output_path_must_be_relative() {
        let wf = WorkflowSpec::new("wf").with_call(task_call("a", "../escape.txt"));
        assert!(validate_plan(&wf, false).is_err());

        let wf = WorkflowSpec::new("wf").with_call(task_call("a", "/abs.txt"));
        assert!(validate_plan(&wf, false).is_err());

        assert!(is_clean_relative("reports/subdir/myreport.txt"));
    }

    #[test]
    fn test_execution_order() {
        let calls = vec![
            task_call("c", "c").depends_on("b"),
            task_call("a", "a"),
            task_call("b", "b").depends_on("a"),
        ];
        let order = execution_order(&calls).unwrap();
        let ids: Vec<&str> = order.iter().map(|&i| calls[i].id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sibling_relative_outputs_collide() {
        let wf = WorkflowSpec::new("wf")
            .with_call(task_call("left", "data.txt"))
            .with_call(task_call("right", "data.txt"));

        assert!(validate_plan(&wf, false).is_ok());
        match validate_plan(&wf, true) {
            Err(RunError::NamingCollision { path, .. }) => {
                assert_eq!(path, PathBuf::from("out/data.txt"))
            }
            other => panic!("expected collision, got {:?}", other),
        }
    }

    #[test]
    fn test_scatter_relative_outputs_collide() {
        let body = CallBody::Task(
            Task::new("t", "echo ~{x} > r.txt").with_output(OutputDecl::file("r", "r.txt")),
        );
        let scatter = |items: Vec<Value>| {
            WorkflowSpec::new("wf").with_call(CallNode::new(
                "s",
                CallBody::Scatter(Scatter {
                    variable: "x".into(),
                    items,
                    body: Box::new(body.clone()),
                }),
            ))
        };

        assert!(validate_plan(&scatter(vec![Value::Int(1)]), true).is_ok());
        assert!(matches!(
            validate_plan(&scatter(vec![Value::Int(1), Value::Int(2)]), true),
            Err(RunError::NamingCollision { .. })
        ));
    }
}
