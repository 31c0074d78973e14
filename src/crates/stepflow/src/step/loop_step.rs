//! Loop step: repeat a child step until an exit condition holds

use super::{required_child, StepMeta, StepRegistry, StepResult, WorkflowStep};
use crate::context::ExecutionContext;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default iteration cap
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Repeats `step` at most `max_iterations` times
///
/// The exit condition is checked before every iteration except the first, so
/// the body always runs at least once. Each iteration runs in a sub-context
/// that is merged back afterwards; `step.<id>.current_iteration` holds the
/// 0-based index while it runs.
#[derive(Debug, Clone)]
pub struct LoopStep {
    meta: StepMeta,
    step: Arc<dyn WorkflowStep>,
    max_iterations: usize,
    exit_condition: Option<String>,
}

impl LoopStep {
    pub fn new(name: impl Into<String>, step: Arc<dyn WorkflowStep>) -> Self {
        Self {
            meta: StepMeta::new(name),
            step,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            exit_condition: None,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_exit_condition(mut self, condition: impl Into<String>) -> Self {
        self.exit_condition = Some(condition.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.meta.description = description.into();
        self
    }

    pub(crate) fn from_descriptor(
        descriptor: &Value,
        registry: &StepRegistry,
    ) -> Result<Arc<dyn WorkflowStep>> {
        let meta = StepMeta::from_descriptor(descriptor)?;
        let step = required_child(descriptor, "step", "loop", registry)?;
        let max_iterations = descriptor
            .get("max_iterations")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_ITERATIONS);
        let exit_condition = descriptor
            .get("exit_condition")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string);

        Ok(Arc::new(Self {
            meta,
            step,
            max_iterations,
            exit_condition,
        }))
    }
}

#[async_trait]
impl WorkflowStep for LoopStep {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn name(&self) -> &str {
        &self.meta.name
    }

    fn description(&self) -> &str {
        &self.meta.description
    }

    fn step_type(&self) -> &'static str {
        "loop"
    }

    async fn execute(&self, context: &mut ExecutionContext) -> StepResult {
        let mut iterations = Vec::new();
        let mut failure = None;

        for iteration in 0..self.max_iterations {
            if iteration > 0 {
                if let Some(condition) = &self.exit_condition {
                    if context.evaluate_condition(condition) {
                        debug!(step = %self.meta.name, iteration, "Loop exit condition met");
                        break;
                    }
                }
            }

            context.set_step_value(&self.meta.id, "current_iteration", json!(iteration));

            let mut sub_context = context.sub_context();
            let result = self.step.execute(&mut sub_context).await;
            context.absorb(sub_context);

            let output = Value::Object(result.output.clone());
            context.set_step_value(&self.meta.id, &format!("iterations.{}", iteration), output.clone());
            iterations.push(output);

            if !result.success {
                warn!(
                    step = %self.meta.name,
                    iteration,
                    error = %result.error_message(),
                    "Loop iteration failed"
                );
                failure = Some(format!(
                    "Iteration {} failed: {}",
                    iteration,
                    result.error_message()
                ));
                break;
            }
        }

        let total = iterations.len();
        context.set_step_value(&self.meta.id, "total_iterations", json!(total));

        let mut output = Map::new();
        output.insert("iterations".to_string(), Value::Array(iterations));
        output.insert("total_iterations".to_string(), json!(total));

        match failure {
            Some(error) => StepResult::failed(error).with_output(output),
            None => StepResult::ok(output),
        }
    }

    fn to_descriptor(&self) -> Result<Value> {
        let mut map = self.meta.descriptor(self.step_type());
        map.insert("step".to_string(), self.step.to_descriptor()?);
        map.insert("max_iterations".to_string(), json!(self.max_iterations));
        map.insert(
            "exit_condition".to_string(),
            self.exit_condition
                .as_ref()
                .map(|c| json!(c))
                .unwrap_or(Value::Null),
        );
        Ok(Value::Object(map))
    }

    fn children(&self) -> Vec<Arc<dyn WorkflowStep>> {
        vec![self.step.clone()]
    }
}
