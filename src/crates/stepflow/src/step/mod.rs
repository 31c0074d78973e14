//! Workflow steps
//!
//! Every step implements [`WorkflowStep`]: it executes against an
//! [`ExecutionContext`], produces a [`StepResult`], and serializes itself to a
//! JSON descriptor (`{"type": ..., "id": ..., "name": ..., ...}`). Descriptors
//! are turned back into steps by a [`StepRegistry`].
//!
//! Built-in variants:
//! - [`TaskStep`] dispatches delegated work through the execution layer
//! - [`ConditionalStep`] runs one of two branches based on a condition
//! - [`ParallelStep`] fans out children concurrently and fans back in
//! - [`LoopStep`] repeats a child until an exit condition holds
//! - [`ProcessingStep`] applies a registered function to context data

pub mod conditional;
pub mod loop_step;
pub mod parallel;
pub mod processing;
pub mod registry;
pub mod task;

pub use conditional::ConditionalStep;
pub use loop_step::LoopStep;
pub use parallel::ParallelStep;
pub use processing::{ProcessingFn, ProcessingStep};
pub use registry::{StepConstructor, StepRegistry};
pub use task::TaskStep;

use crate::context::ExecutionContext;
use crate::error::{Result, StepflowError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of one step execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl StepResult {
    /// Successful result
    pub fn ok(output: Map<String, Value>) -> Self {
        Self {
            success: true,
            output,
            error: None,
            task_id: None,
        }
    }

    /// Failed result; the error is never empty
    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            output: Map::new(),
            error: Some(if error.trim().is_empty() {
                "unknown error".to_string()
            } else {
                error
            }),
            task_id: None,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_output(mut self, output: Map<String, Value>) -> Self {
        self.output = output;
        self
    }

    /// Error message, or an empty string on success
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }
}

/// Identity shared by all step variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMeta {
    #[serde(default = "new_step_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

fn new_step_id() -> String {
    Uuid::new_v4().to_string()
}

impl StepMeta {
    /// New identity with a freshly generated id
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_step_id(),
            name: name.into(),
            description: String::new(),
        }
    }

    /// Read the identity fields of a descriptor
    pub fn from_descriptor(descriptor: &Value) -> Result<Self> {
        serde_json::from_value(descriptor.clone())
            .map_err(|e| StepflowError::Deserialization(format!("invalid step identity: {}", e)))
    }

    /// Descriptor skeleton: `{"type", "id", "name", "description"}`
    pub fn descriptor(&self, step_type: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("type".to_string(), Value::String(step_type.to_string()));
        map.insert("id".to_string(), Value::String(self.id.clone()));
        map.insert("name".to_string(), Value::String(self.name.clone()));
        map.insert(
            "description".to_string(),
            Value::String(self.description.clone()),
        );
        map
    }
}

/// A composable unit of workflow execution
#[async_trait]
pub trait WorkflowStep: Send + Sync + std::fmt::Debug {
    /// Stable id, the join key for `step.<id>.*` context entries
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Registered variant name (`task`, `conditional`, ...)
    fn step_type(&self) -> &'static str;

    /// Execute against the context
    ///
    /// Failures are reported through the returned [`StepResult`], never as a
    /// panic or error.
    async fn execute(&self, context: &mut ExecutionContext) -> StepResult;

    /// Serialize to a descriptor that [`StepRegistry::deserialize`] accepts
    fn to_descriptor(&self) -> Result<Value>;

    /// Nested steps, in execution order
    fn children(&self) -> Vec<Arc<dyn WorkflowStep>> {
        Vec::new()
    }
}

/// Read a required string field from a descriptor
pub(crate) fn required_str<'a>(descriptor: &'a Value, field: &str, step_type: &str) -> Result<&'a str> {
    descriptor
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            StepflowError::Deserialization(format!(
                "{} step is missing string field '{}'",
                step_type, field
            ))
        })
}

/// Read a required nested step descriptor
pub(crate) fn required_child(
    descriptor: &Value,
    field: &str,
    step_type: &str,
    registry: &StepRegistry,
) -> Result<Arc<dyn WorkflowStep>> {
    let child = descriptor.get(field).filter(|v| !v.is_null()).ok_or_else(|| {
        StepflowError::Deserialization(format!(
            "{} step is missing nested step '{}'",
            step_type, field
        ))
    })?;
    registry.deserialize(child)
}
