//! Parallel step: bounded fan-out over child steps, then fan-in

use super::{StepMeta, StepRegistry, StepResult, WorkflowStep};
use crate::context::ExecutionContext;
use crate::error::{Result, StepflowError};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Runs every child concurrently, each against its own sub-context
///
/// Each child is a spawned task holding a semaphore permit, so at most
/// `max_concurrent` run at once; without an explicit limit the execution
/// layer's `max_concurrent` setting applies. All children run to completion;
/// their sub-contexts are then merged back in child order. Records
/// `step.<id>.results.<i>` and `step.<id>.task_ids.<i>` and succeeds only if
/// every child succeeded.
#[derive(Debug, Clone)]
pub struct ParallelStep {
    meta: StepMeta,
    steps: Vec<Arc<dyn WorkflowStep>>,
    max_concurrent: Option<usize>,
}

impl ParallelStep {
    pub fn new(name: impl Into<String>, steps: Vec<Arc<dyn WorkflowStep>>) -> Self {
        Self {
            meta: StepMeta::new(name),
            steps,
            max_concurrent: None,
        }
    }

    /// Concurrency limit; 0 is treated as 1
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = Some(max_concurrent);
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
        let steps = descriptor
            .get("steps")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                StepflowError::Deserialization("parallel step is missing 'steps' array".to_string())
            })?
            .iter()
            .map(|child| registry.deserialize(child))
            .collect::<Result<Vec<_>>>()?;
        let max_concurrent = descriptor
            .get("max_concurrent")
            .and_then(Value::as_u64)
            .map(|n| n as usize);

        Ok(Arc::new(Self {
            meta,
            steps,
            max_concurrent,
        }))
    }
}

#[async_trait]
impl WorkflowStep for ParallelStep {
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
        "parallel"
    }

    async fn execute(&self, context: &mut ExecutionContext) -> StepResult {
        let limit = self
            .max_concurrent
            .unwrap_or_else(|| context.execution().config().max_concurrent)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(limit));

        debug!(
            step = %self.meta.name,
            branches = self.steps.len(),
            max_concurrent = limit,
            "Starting parallel branches"
        );

        let handles: Vec<_> = self
            .steps
            .iter()
            .map(|child| {
                let child = child.clone();
                let semaphore = semaphore.clone();
                let mut sub_context = context.sub_context();
                tokio::spawn(async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => child.execute(&mut sub_context).await,
                        Err(e) => StepResult::failed(format!("Branch could not start: {}", e)),
                    };
                    (result, sub_context)
                })
            })
            .collect();

        let joined = join_all(handles).await;

        let mut results = Vec::with_capacity(joined.len());
        let mut task_ids = Vec::with_capacity(joined.len());
        let mut errors = Vec::new();

        for (index, (child, joined)) in self.steps.iter().zip(joined).enumerate() {
            let result = match joined {
                Ok((result, sub_context)) => {
                    context.absorb(sub_context);
                    result
                }
                Err(e) => {
                    warn!(step = %self.meta.name, branch = %child.name(), error = %e, "Parallel branch aborted");
                    StepResult::failed(format!("Step panicked: {}", e))
                }
            };

            let output = Value::Object(result.output.clone());
            let task_id = result.task_id.clone().map(Value::String).unwrap_or(Value::Null);
            context.set_step_value(&self.meta.id, &format!("results.{}", index), output.clone());
            context.set_step_value(&self.meta.id, &format!("task_ids.{}", index), task_id.clone());
            results.push(output);
            task_ids.push(task_id);

            if !result.success {
                errors.push(result.error_message().to_string());
            }
        }

        let mut output = Map::new();
        output.insert("results".to_string(), Value::Array(results));
        output.insert("task_ids".to_string(), Value::Array(task_ids));

        if errors.is_empty() {
            StepResult::ok(output)
        } else {
            StepResult::failed(errors.join("; ")).with_output(output)
        }
    }

    fn to_descriptor(&self) -> Result<Value> {
        let mut map = self.meta.descriptor(self.step_type());
        let steps = self
            .steps
            .iter()
            .map(|step| step.to_descriptor())
            .collect::<Result<Vec<_>>>()?;
        map.insert("steps".to_string(), Value::Array(steps));
        if let Some(max_concurrent) = self.max_concurrent {
            map.insert("max_concurrent".to_string(), json!(max_concurrent));
        }
        Ok(Value::Object(map))
    }

    fn children(&self) -> Vec<Arc<dyn WorkflowStep>> {
        self.steps.clone()
    }
}
