//! Plan Definition Module
//!
//! Data structures handed to the scheduler by the evaluator: tasks, call
//! graphs, scatters and nested workflows, plus their typed values.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Task, CallNode, WorkflowSpec)
//! - [`value`]: Typed input and output values
//! - [`parser`]: YAML plan loading
//! - [`validator`]: Validation rules and dependency ordering

pub mod model;
pub mod parser;
pub mod validator;
pub mod value;

pub use model::{CallBody, CallNode, OutputDecl, ResourceRequest, RuntimeOptions, Scatter, Task, WorkflowSpec};
pub use parser::{load_plan, parse_plan};
pub use validator::{execution_order, validate_plan, ValidationError};
pub use value::Value;
