//! Workflow Data Model
//!
//! Core data structures of an execution plan: tasks, the calls that
//! arrange them, scatters and nested workflows.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: variant_calling
//! calls:
//!   - id: align
//!     call:
//!       kind: task
//!       name: bwa_mem
//!       image: biocontainers/bwa:0.7.17
//!       command: bwa mem ~{reference} ~{reads} > aligned.sam
//!       resources: {cpu: 8, memory: 16G}
//!       inputs:
//!         reference: {File: /data/ref.fa}
//!         reads: {File: /data/reads.fq}
//!       outputs:
//!         - {name: sam, path: aligned.sam}
//!
//!   - id: per_region
//!     after: align
//!     call:
//!       kind: scatter
//!       variable: region
//!       items: [chr1, chr2, chr3]
//!       body:
//!         kind: task
//!         name: call_region
//!         command: caller --region ~{region} > calls.vcf
//!         outputs:
//!           - {name: vcf, path: calls.vcf}
//! ```

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::value::Value;
use crate::config::optional_byte_size;

/// Declared cpu/memory needs of a task; unset fields take runtime defaults.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ResourceRequest {
    #[serde(default)]
    pub cpu: Option<u32>,

    /// Memory in bytes; YAML accepts sizes such as `4G`
    #[serde(default, deserialize_with = "optional_byte_size")]
    pub memory: Option<u64>,
}

/// A declared output: a path relative to the task's working directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutputDecl {
    pub name: String,
    pub path: String,

    #[serde(default)]
    pub directory: bool,

    /// A missing optional output is bound to `Null` instead of failing
    #[serde(default)]
    pub optional: bool,
}

impl OutputDecl {
    pub fn file(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            directory: false,
            optional: false,
        }
    }
}

/// Per-task overrides of container runtime options.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RuntimeOptions {
    #[serde(default)]
    pub network: Option<String>,

    #[serde(default)]
    pub privileged: bool,

    #[serde(default)]
    pub mount_tmpdir: Option<bool>,
}

/// A single containerized unit of work.
///
/// Immutable once submitted to the scheduler.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Task {
    pub name: String,

    /// Command template; `~{input}` is replaced by the input's container-side rendering
    pub command: String,

    #[serde(default)]
    pub image: Option<String>,

    #[serde(default)]
    pub resources: ResourceRequest,

    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,

    #[serde(default)]
    pub outputs: Vec<OutputDecl>,

    #[serde(default)]
    pub runtime: RuntimeOptions,
}

impl Task {
    /// Creates a task with no inputs, outputs or resource declarations.
    ///
    /// # Example
    ///
    /// ```
    /// use wdlrunner::workflow::{OutputDecl, Task, Value};
    ///
    /// let task = Task::new("count", "wc -l ~{reads} > count.txt")
    ///     .with_input("reads", Value::file("/data/reads.fq"))
    ///     .with_output(OutputDecl::file("count", "count.txt"))
    ///     .with_cpu(2);
    /// ```
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            command: command.into(),
            image: None,
            resources: ResourceRequest::default(),
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            runtime: RuntimeOptions::default(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn with_output(mut self, output: OutputDecl) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.resources.cpu = Some(cpu);
        self
    }

    pub fn with_memory(mut self, memory: u64) -> Self {
        self.resources.memory = Some(memory);
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.runtime.network = Some(network.into());
        self
    }

    /// Identity of the task definition, excluding its input values.
    ///
    /// Two tasks with equal identity and equal inputs produce equal outputs.
    pub fn identity(&self) -> serde_json::Value {
        json!({
            "name": self.name,
            "command": self.command,
            "image": self.image,
            "outputs": self.outputs,
        })
    }
}

/// A scatter: the body is instantiated once per item with `variable` bound.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Scatter {
    pub variable: String,

    #[serde(default)]
    pub items: Vec<Value>,

    pub body: Box<CallBody>,
}

/// What a call node runs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallBody {
    Task(Task),
    Workflow(WorkflowSpec),
    Scatter(Scatter),
}

impl CallBody {
    /// Binds `variable` as an input of every task reachable from this call.
    pub fn bind(&self, variable: &str, value: &Value) -> CallBody {
        match self {
            Self::Task(task) => Self::Task(task.clone().with_input(variable, value.clone())),
            Self::Workflow(wf) => Self::Workflow(WorkflowSpec {
                name: wf.name.clone(),
                calls: wf
                    .calls
                    .iter()
                    .map(|node| CallNode {
                        id: node.id.clone(),
                        after: node.after.clone(),
                        call: node.call.bind(variable, value),
                    })
                    .collect(),
            }),
            Self::Scatter(scatter) => Self::Scatter(Scatter {
                variable: scatter.variable.clone(),
                items: scatter.items.clone(),
                body: Box::new(scatter.body.bind(variable, value)),
            }),
        }
    }
}

/// A node of a workflow's call graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CallNode {
    /// Unique among siblings
    pub id: String,

    /// Sibling call ids that must complete successfully first
    #[serde(deserialize_with = "single_or_vec", default)]
    pub after: Vec<String>,

    pub call: CallBody,
}

impl CallNode {
    pub fn new(id: impl Into<String>, call: CallBody) -> Self {
        Self {
            id: id.into(),
            after: Vec::new(),
            call,
        }
    }

    pub fn task(id: impl Into<String>, task: Task) -> Self {
        Self::new(id, CallBody::Task(task))
    }

    /// Adds a dependency on a sibling call.
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.after.push(id.into());
        self
    }
}

/// A workflow: named set of calls forming a DAG.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowSpec {
    pub name: String,

    #[serde(default)]
    pub calls: Vec<CallNode>,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Vec::new(),
        }
    }

    pub fn with_call(mut self, call: CallNode) -> Self {
        self.calls.push(call);
        self
    }
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::String(s) if s.is_empty() => Ok(Vec::new()),
        serde_json::Value::String(s) => Ok(vec![s]),
        serde_json::Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                serde_json::Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_builder() {
        let task = Task::new("  count ", "wc -l ~{reads}")
            .with_input("reads", Value::file("/r.fq"))
            .with_cpu(2)
            .with_memory(1_000);

        assert_eq!(task.name, "count");
        assert_eq!(task.resources.cpu, Some(2));
        assert_eq!(task.resources.memory, Some(1_000));
        assert!(task.inputs.contains_key("reads"));
    }

    #[test]
    fn test_parse_call_kinds() {
        let yaml = r#"
name: wf
calls:
  - id: a
    call:
      kind: task
      name: hello
      command: echo hi > out.txt
      resources: {cpu: 2, memory: 1G}
      outputs:
        - {name: greeting, path: out.txt}
  - id: b
    after: a
    call:
      kind: scatter
      variable: x
      items: [1, 2]
      body:
        kind: task
        name: square
        command: echo $((~{x} * ~{x}))
  - id: c
    after: [a, b]
    call:
      kind: workflow
      name: inner
      calls: []
"#;
        let wf: WorkflowSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(wf.calls.len(), 3);

        match &wf.calls[0].call {
            CallBody::Task(t) => {
                assert_eq!(t.resources.memory, Some(1_000_000_000));
                assert_eq!(t.outputs[0].path, "out.txt");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(wf.calls[1].after, vec!["a"]);
        assert!(matches!(wf.calls[1].call, CallBody::Scatter(_)));
        assert_eq!(wf.calls[2].after, vec!["a", "b"]);
        assert!(matches!(wf.calls[2].call, CallBody::Workflow(_)));
    }

    #[test]
    fn test_bind_reaches_nested_tasks() {
        let inner = WorkflowSpec::new("inner").with_call(CallNode::task("t", Task::new("t", "echo ~{x}")));
        let body = CallBody::Workflow(inner);

        let bound = body.bind("x", &Value::Int(7));
        let CallBody::Workflow(wf) = bound else {
            panic!("expected workflow");
        };
        let CallBody::Task(task) = &wf.calls[0].call else {
            panic!("expected task");
        };
        assert_eq!(task.inputs["x"], Value::Int(7));
    }

    #[test]
    fn test_identity_ignores_inputs() {
        let a = Task::new("t", "echo").with_input("x", Value::Int(1));
        let b = Task::new("t", "echo").with_input("x", Value::Int(2));
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), Task::new("t", "echo hi").identity());
    }
}
