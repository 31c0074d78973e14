//! Conditional step: pick one branch by evaluating a condition

use super::{required_child, required_str, StepMeta, StepRegistry, StepResult, WorkflowStep};
use crate::context::ExecutionContext;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Runs `if_step` when the condition holds, otherwise `else_step` (if any)
///
/// Records `step.<id>.condition_result` and `step.<id>.branch_taken`
/// (`if`, `else` or `none`). The result is the taken branch's result.
#[derive(Debug, Clone)]
pub struct ConditionalStep {
    meta: StepMeta,
    condition: String,
    if_step: Arc<dyn WorkflowStep>,
    else_step: Option<Arc<dyn WorkflowStep>>,
}

impl ConditionalStep {
    pub fn new(
        name: impl Into<String>,
        condition: impl Into<String>,
        if_step: Arc<dyn WorkflowStep>,
    ) -> Self {
        Self {
            meta: StepMeta::new(name),
            condition: condition.into(),
            if_step,
            else_step: None,
        }
    }

    pub fn with_else(mut self, else_step: Arc<dyn WorkflowStep>) -> Self {
        self.else_step = Some(else_step);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.meta.description = description.into();
        self
    }

    pub fn condition(&self) -> &str {
        &self.condition
    }

    pub(crate) fn from_descriptor(
        descriptor: &Value,
        registry: &StepRegistry,
    ) -> Result<Arc<dyn WorkflowStep>> {
        let meta = StepMeta::from_descriptor(descriptor)?;
        let condition = required_str(descriptor, "condition", "conditional")?.to_string();
        let if_step = required_child(descriptor, "if_step", "conditional", registry)?;
        let else_step = match descriptor.get("else_step") {
            None | Some(Value::Null) => None,
            Some(child) => Some(registry.deserialize(child)?),
        };

        Ok(Arc::new(Self {
            meta,
            condition,
            if_step,
            else_step,
        }))
    }
}

#[async_trait]
impl WorkflowStep for ConditionalStep {
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
        "conditional"
    }

    async fn execute(&self, context: &mut ExecutionContext) -> StepResult {
        let holds = context.evaluate_condition(&self.condition);
        context.set_step_value(&self.meta.id, "condition_result", json!(holds));

        let (branch, step) = match (holds, &self.else_step) {
            (true, _) => ("if", Some(&self.if_step)),
            (false, Some(else_step)) => ("else", Some(else_step)),
            (false, None) => ("none", None),
        };
        context.set_step_value(&self.meta.id, "branch_taken", json!(branch));

        debug!(
            step = %self.meta.name,
            condition = %self.condition,
            result = holds,
            branch = branch,
            "Condition evaluated"
        );

        match step {
            Some(step) => step.execute(context).await,
            None => StepResult::ok(Map::new()),
        }
    }

    fn to_descriptor(&self) -> Result<Value> {
        let mut map = self.meta.descriptor(self.step_type());
        map.insert("condition".to_string(), json!(self.condition));
        map.insert("if_step".to_string(), self.if_step.to_descriptor()?);
        map.insert(
            "else_step".to_string(),
            match &self.else_step {
                Some(step) => step.to_descriptor()?,
                None => Value::Null,
            },
        );
        Ok(Value::Object(map))
    }

    fn children(&self) -> Vec<Arc<dyn WorkflowStep>> {
        let mut children = vec![self.if_step.clone()];
        children.extend(self.else_step.clone());
        children
    }
}
