//! Task step: dispatch one unit of delegated work

use super::{required_str, StepMeta, StepRegistry, StepResult, WorkflowStep};
use crate::context::ExecutionContext;
use crate::error::{Result, StepflowError};
use crate::execution::{ExecutionLayer, RetryPolicy, WorkUnit};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-step retry settings; unset fields use the execution layer's
/// `max_retries` and `retry_delay_ms`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct TaskRetry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry_delay_ms: Option<u64>,
}

impl TaskRetry {
    fn resolve(&self, defaults: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_delay_ms: self.retry_delay_ms.unwrap_or(defaults.retry_delay_ms),
        }
    }
}

impl From<RetryPolicy> for TaskRetry {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            max_retries: Some(policy.max_retries),
            retry_delay_ms: Some(policy.retry_delay_ms),
        }
    }
}

/// Sends a templated instruction to a worker and records its output
///
/// Writes `step.<id>.task_id` and, on success, `step.<id>.result`.
#[derive(Debug, Clone)]
pub struct TaskStep {
    meta: StepMeta,
    task: String,
    input: Value,
    target: Option<String>,
    agent_type: Option<String>,
    capabilities: Vec<String>,
    retry: Option<TaskRetry>,
}

impl TaskStep {
    /// New task step; `task` may contain `{{key}}` placeholders
    pub fn new(name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            meta: StepMeta::new(name),
            task: task.into(),
            input: Value::Null,
            target: None,
            agent_type: None,
            capabilities: Vec::new(),
            retry: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.meta.description = description.into();
        self
    }

    /// Structured input, template-resolved at execution time
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Always run on this target
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Run on the worker created for this agent type
    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    /// Capabilities the routed target must offer
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Retry failed runs with a fixed delay
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy.into());
        self
    }

    /// Retry failed runs with the execution layer's configured policy
    pub fn with_default_retry(mut self) -> Self {
        self.retry = Some(TaskRetry::default());
        self
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub(crate) fn from_descriptor(descriptor: &Value, _registry: &StepRegistry) -> Result<Arc<dyn WorkflowStep>> {
        let meta = StepMeta::from_descriptor(descriptor)?;
        let task = required_str(descriptor, "task", "task")?.to_string();
        let optional_str = |field: &str| {
            descriptor
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let capabilities = match descriptor.get("capabilities") {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                StepflowError::Deserialization(format!("task step capabilities: {}", e))
            })?,
        };

        // `retry: true` or `retry: {}` take the configured policy
        let retry = match descriptor.get("retry") {
            None | Some(Value::Null) | Some(Value::Bool(false)) => None,
            Some(Value::Bool(true)) => Some(TaskRetry::default()),
            Some(value) => Some(serde_json::from_value(value.clone()).map_err(|e| {
                StepflowError::Deserialization(format!("task step retry: {}", e))
            })?),
        };

        Ok(Arc::new(Self {
            meta,
            task,
            input: descriptor.get("input").cloned().unwrap_or(Value::Null),
            target: optional_str("target"),
            agent_type: optional_str("agent_type"),
            capabilities,
            retry,
        }))
    }

    /// Explicit target, then context override, then agent type, then router
    fn resolve_target(
        &self,
        context: &ExecutionContext,
        layer: &ExecutionLayer,
        work_id: &str,
    ) -> Result<String> {
        if let Some(target) = &self.target {
            return Ok(target.clone());
        }

        let override_key = format!("workflow.target_overrides.{}", self.meta.name);
        if let Some(target) = context.get(&override_key).and_then(Value::as_str) {
            debug!(step = %self.meta.name, target = %target, "Using target override");
            return Ok(target.to_string());
        }

        if let Some(agent_type) = &self.agent_type {
            return layer.resolve_agent_type(agent_type);
        }

        layer.select_target(work_id)
    }
}

#[async_trait]
impl WorkflowStep for TaskStep {
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
        "task"
    }

    async fn execute(&self, context: &mut ExecutionContext) -> StepResult {
        let layer = context.execution().clone();
        let description = context.resolve_template(&self.task);
        let input = context.resolve_value(&self.input);

        let work = WorkUnit::new(self.meta.name.clone(), description)
            .with_input(input)
            .with_capabilities(self.capabilities.clone());
        let work_id = layer.submit(work);
        context.set_step_value(&self.meta.id, "task_id", json!(work_id));

        let target = match self.resolve_target(context, &layer, &work_id) {
            Ok(target) => target,
            Err(e) => {
                warn!(step = %self.meta.name, error = %e, "No target for task step");
                let error = format!("Task execution failed: {}", e);
                context.set_step_value(&self.meta.id, "error", json!(error));
                return StepResult::failed(error).with_task_id(work_id);
            }
        };

        let workflow_id = context.workflow_id().to_string();
        let outcome = match &self.retry {
            Some(retry) => {
                let policy = retry.resolve(layer.config().retry_policy());
                layer
                    .run_with_retry(&work_id, &target, Some(&workflow_id), &policy)
                    .await
            }
            None => layer.run(&work_id, &target, Some(&workflow_id)).await,
        };

        match outcome {
            Ok(outcome) if outcome.is_completed() => {
                let result = outcome.output.unwrap_or(Value::Null);
                context.set_step_value(&self.meta.id, "result", result.clone());

                let mut output = Map::new();
                output.insert("result".to_string(), result);
                output.insert("task_id".to_string(), json!(work_id));
                StepResult::ok(output).with_task_id(work_id)
            }
            Ok(outcome) => {
                let error = outcome
                    .error
                    .unwrap_or_else(|| format!("work unit {} did not complete", work_id));
                context.set_step_value(&self.meta.id, "error", json!(error));
                StepResult::failed(error).with_task_id(work_id)
            }
            Err(e) => {
                let error = format!("Task execution failed: {}", e);
                context.set_step_value(&self.meta.id, "error", json!(error));
                StepResult::failed(error).with_task_id(work_id)
            }
        }
    }

    fn to_descriptor(&self) -> Result<Value> {
        let mut map = self.meta.descriptor(self.step_type());
        map.insert("task".to_string(), json!(self.task));
        if !self.input.is_null() {
            map.insert("input".to_string(), self.input.clone());
        }
        if let Some(target) = &self.target {
            map.insert("target".to_string(), json!(target));
        }
        if let Some(agent_type) = &self.agent_type {
            map.insert("agent_type".to_string(), json!(agent_type));
        }
        if !self.capabilities.is_empty() {
            map.insert("capabilities".to_string(), json!(self.capabilities));
        }
        match &self.retry {
            Some(retry) if *retry == TaskRetry::default() => {
                map.insert("retry".to_string(), json!(true));
            }
            Some(retry) => {
                map.insert("retry".to_string(), serde_json::to_value(retry)?);
            }
            None => {}
        }
        Ok(Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Services;
    use crate::execution::{EchoWorker, TargetProfile};
    use crate::testing::{CountingWorker, FailingWorker, FlakyWorker};
    use std::time::Duration;

    fn context_with(layer: ExecutionLayer) -> ExecutionContext {
        ExecutionContext::new("wf-test", Arc::new(Services::new(Arc::new(layer))))
    }

    #[tokio::test]
    async fn test_task_resolves_template_and_records_result() {
        let layer = ExecutionLayer::default();
        layer.register_worker("echo", Arc::new(EchoWorker));
        let mut ctx = context_with(layer);
        ctx.set("topic", json!("rust"));

        let step = TaskStep::new("write", "Write about {{topic}}");
        let result = step.execute(&mut ctx).await;

        assert!(result.success);
        assert_eq!(result.output["result"], json!("Write about rust"));
        let task_id = result.task_id.clone().unwrap();
        assert_eq!(result.output["task_id"], json!(task_id));
        assert_eq!(
            ctx.get(&format!("step.{}.result", step.id())),
            Some(&json!("Write about rust"))
        );
        assert_eq!(
            ctx.get(&format!("step.{}.task_id", step.id())),
            Some(&json!(task_id))
        );

        let work = ctx.execution().get_work(&task_id).unwrap();
        assert_eq!(work.workflow_id.as_deref(), Some("wf-test"));
    }

    #[tokio::test]
    async fn test_task_failure_is_wrapped() {
        let layer = ExecutionLayer::default();
        layer.register_worker("bad", Arc::new(FailingWorker::new("quota exceeded")));
        let mut ctx = context_with(layer);

        let result = TaskStep::new("t", "do it").execute(&mut ctx).await;
        assert!(!result.success);
        assert!(result.error_message().contains("quota exceeded"));
        assert!(result.task_id.is_some());
    }

    #[tokio::test]
    async fn test_task_without_targets_fails() {
        let mut ctx = context_with(ExecutionLayer::default());
        let step = TaskStep::new("t", "do it");
        let result = step.execute(&mut ctx).await;
        assert!(!result.success);
        assert!(result.error_message().contains("No execution target available"));
        assert_eq!(
            ctx.get(&format!("step.{}.error", step.id())),
            Some(&json!(result.error_message()))
        );
    }

    #[tokio::test]
    async fn test_target_resolution_order() {
        let layer = ExecutionLayer::default();
        let explicit = Arc::new(CountingWorker::new());
        let overridden = Arc::new(CountingWorker::new());
        let routed = Arc::new(CountingWorker::new());
        let agent = Arc::new(CountingWorker::new());
        layer.register_worker("routed", routed.clone());
        layer.register_worker("explicit", explicit.clone());
        layer.register_worker("overridden", overridden.clone());
        let agent_worker = agent.clone();
        layer
            .register_agent_type(
                "reviewer",
                Arc::new(move |_: &str| -> Result<Arc<dyn crate::execution::Worker>> {
                    Ok(agent_worker.clone() as Arc<dyn crate::execution::Worker>)
                }),
            )
            .unwrap();

        let mut ctx = context_with(layer);
        ctx.set(
            "workflow.target_overrides",
            json!({"Review": "overridden"}),
        );

        TaskStep::new("Review", "x")
            .with_target("explicit")
            .with_agent_type("reviewer")
            .execute(&mut ctx)
            .await;
        assert_eq!(explicit.count(), 1);

        TaskStep::new("Review", "x")
            .with_agent_type("reviewer")
            .execute(&mut ctx)
            .await;
        assert_eq!(overridden.count(), 1);

        TaskStep::new("Other", "x")
            .with_agent_type("reviewer")
            .execute(&mut ctx)
            .await;
        assert_eq!(agent.count(), 1);

        TaskStep::new("Other", "x").execute(&mut ctx).await;
        assert_eq!(
            explicit.count() + overridden.count() + routed.count(),
            3,
            "router fallback must pick a registered target"
        );
    }

    #[tokio::test]
    async fn test_capabilities_route_to_matching_target() {
        let layer = ExecutionLayer::new(crate::config::ExecutionConfig {
            routing_strategy: crate::execution::RoutingStrategy::CapabilityMatch,
            ..Default::default()
        });
        let plain = Arc::new(CountingWorker::new());
        let coder = Arc::new(CountingWorker::new());
        layer.register_target(TargetProfile::new("plain"), plain.clone());
        layer.register_target(
            TargetProfile::new("coder").with_capabilities(["code"]),
            coder.clone(),
        );
        let mut ctx = context_with(layer);

        let result = TaskStep::new("build", "compile")
            .with_capabilities(["code"])
            .execute(&mut ctx)
            .await;
        assert!(result.success);
        assert_eq!(coder.count(), 1);
        assert_eq!(plain.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_retry_policy() {
        let layer = ExecutionLayer::default();
        let flaky = Arc::new(FlakyWorker::new(2));
        layer.register_worker("flaky", flaky.clone());
        let mut ctx = context_with(layer);

        let result = TaskStep::new("t", "eventually")
            .with_retry(RetryPolicy::new(3, Duration::from_millis(10)))
            .execute(&mut ctx)
            .await;
        assert!(result.success);
        assert_eq!(flaky.attempts(), 3);
    }

    #[tokio::test]
    async fn test_retry_defaults_come_from_execution_config() {
        let layer = ExecutionLayer::new(crate::config::ExecutionConfig {
            max_retries: 2,
            retry_delay_ms: 1,
            ..Default::default()
        });
        let flaky = Arc::new(FlakyWorker::new(2));
        layer.register_worker("flaky", flaky.clone());
        let mut ctx = context_with(layer);

        let registry = StepRegistry::new();
        let step = registry
            .deserialize(&json!({"type": "task", "name": "t", "task": "again", "retry": {}}))
            .unwrap();
        let result = step.execute(&mut ctx).await;
        assert!(result.success, "{}", result.error_message());
        assert_eq!(flaky.attempts(), 3);
    }

    #[tokio::test]
    async fn test_retry_fields_override_execution_config() {
        let layer = ExecutionLayer::new(crate::config::ExecutionConfig {
            max_retries: 5,
            retry_delay_ms: 1,
            ..Default::default()
        });
        let flaky = Arc::new(FlakyWorker::new(2));
        layer.register_worker("flaky", flaky.clone());
        let mut ctx = context_with(layer);

        let step = StepRegistry::new()
            .deserialize(&json!({
                "type": "task",
                "name": "t",
                "task": "once",
                "retry": {"max_retries": 0}
            }))
            .unwrap();
        let result = step.execute(&mut ctx).await;
        assert!(!result.success);
        assert_eq!(flaky.attempts(), 1);
    }

    #[test]
    fn test_bare_retry_flag_round_trips() {
        let registry = StepRegistry::new();
        let step = registry
            .deserialize(&json!({"type": "task", "name": "t", "task": "x", "retry": true}))
            .unwrap();
        assert_eq!(step.to_descriptor().unwrap()["retry"], json!(true));

        let without = registry
            .deserialize(&json!({"type": "task", "name": "t", "task": "x", "retry": false}))
            .unwrap();
        assert!(without.to_descriptor().unwrap().get("retry").is_none());

        let step = TaskStep::new("t", "x").with_default_retry();
        assert_eq!(step.to_descriptor().unwrap()["retry"], json!(true));
    }

    #[test]
    fn test_descriptor_round_trip() {
        let step = TaskStep::new("write", "Write {{x}}")
            .with_description("writes")
            .with_input(json!({"k": "{{x}}"}))
            .with_target("echo")
            .with_capabilities(["text"])
            .with_retry(RetryPolicy::new(2, Duration::from_millis(5)));
        let descriptor = step.to_descriptor().unwrap();
        assert_eq!(descriptor["type"], "task");
        assert_eq!(descriptor["retry"]["max_retries"], 2);

        let registry = StepRegistry::new();
        let restored = registry.deserialize(&descriptor).unwrap();
        assert_eq!(restored.id(), step.id());
        assert_eq!(restored.name(), "write");
        assert_eq!(restored.description(), "writes");
        assert_eq!(restored.to_descriptor().unwrap(), descriptor);
    }

    #[test]
    fn test_descriptor_requires_task() {
        let registry = StepRegistry::new();
        let result = registry.deserialize(&json!({"type": "task", "name": "x"}));
        assert!(matches!(result, Err(StepflowError::Deserialization(_))));
    }
}
