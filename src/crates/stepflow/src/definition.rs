//! Immutable workflow definitions
//!
//! A definition stores its steps as serialized descriptors. Adding a step
//! returns a new definition and leaves the original untouched; the step tree
//! is rebuilt through a [`StepRegistry`] on every [`WorkflowDefinition::get_steps`].

use crate::config::load_document;
use crate::error::{Result, StepflowError};
use crate::step::{StepRegistry, WorkflowStep};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

fn new_definition_id() -> String {
    Uuid::new_v4().to_string()
}

/// Ordered, serializable composition of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "new_definition_id")]
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Step descriptors in execution order
    #[serde(default)]
    steps: Vec<Value>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_definition_id(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            created_at: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Load a definition from a YAML or JSON file
    ///
    /// YAML files may use `$include` and `${VAR:default}` like config files.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let document = load_document(path.as_ref())?;
        let definition: Self = serde_json::from_value(document).map_err(|e| {
            StepflowError::Deserialization(format!(
                "invalid workflow definition {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        debug!(definition = %definition.name, steps = definition.steps.len(), "Loaded workflow definition");
        Ok(definition)
    }

    /// New definition with `step` appended; `self` is unchanged
    pub fn add_step(&self, step: &dyn WorkflowStep) -> Result<Self> {
        let mut next = self.clone();
        next.steps.push(step.to_descriptor()?);
        Ok(next)
    }

    /// New definition with a raw descriptor appended
    pub fn add_descriptor(&self, descriptor: Value) -> Self {
        let mut next = self.clone();
        next.steps.push(descriptor);
        next
    }

    pub fn descriptors(&self) -> &[Value] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Rebuild the full step tree
    ///
    /// Every call produces fresh step instances. Unknown step types fail.
    pub fn get_steps(&self, registry: &StepRegistry) -> Result<Vec<Arc<dyn WorkflowStep>>> {
        self.steps
            .iter()
            .map(|descriptor| registry.deserialize(descriptor))
            .collect()
    }

    /// Check that the definition is named and every step deserializes
    pub fn validate(&self, registry: &StepRegistry) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(StepflowError::Deserialization(
                "workflow definition has no name".to_string(),
            ));
        }
        for (index, descriptor) in self.steps.iter().enumerate() {
            registry.deserialize(descriptor).map_err(|e| match e {
                StepflowError::Deserialization(msg) => {
                    StepflowError::Deserialization(format!("step {}: {}", index, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{LoopStep, ParallelStep, TaskStep};
    use proptest::prelude::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_add_step_does_not_mutate() {
        let registry = StepRegistry::new();
        let empty = WorkflowDefinition::new("wf");
        let one = empty.add_step(&TaskStep::new("a", "do a")).unwrap();

        assert!(empty.is_empty());
        assert_eq!(one.len(), 1);
        assert_eq!(one.get_steps(&registry).unwrap()[0].name(), "a");
        assert_eq!(one.id, empty.id);
    }

    #[test]
    fn test_get_steps_rebuilds_nested_tree() {
        let registry = StepRegistry::new();
        let inner = Arc::new(TaskStep::new("leaf", "work")) as Arc<dyn WorkflowStep>;
        let def = WorkflowDefinition::new("wf")
            .add_step(&ParallelStep::new(
                "fan",
                vec![inner.clone(), Arc::new(LoopStep::new("repeat", inner.clone()))],
            ))
            .unwrap();

        let first = def.get_steps(&registry).unwrap();
        let second = def.get_steps(&registry).unwrap();
        assert!(!Arc::ptr_eq(&first[0], &second[0]));
        assert_eq!(first[0].children().len(), 2);
        assert_eq!(first[0].children()[1].children()[0].id(), inner.id());
    }

    #[test]
    fn test_unknown_type_fails() {
        let registry = StepRegistry::new();
        let def = WorkflowDefinition::new("wf").add_descriptor(json!({"type": "mystery", "name": "m"}));
        assert!(matches!(
            def.get_steps(&registry),
            Err(StepflowError::UnknownStepType(_))
        ));
        assert!(def.validate(&registry).is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
name: research
description: two step pipeline
steps:
  - type: task
    id: gather
    name: gather
    task: "collect notes"
  - type: task
    name: summarize
    task: "summarize {{{{step.gather.result}}}}"
"#
        )
        .unwrap();

        let def = WorkflowDefinition::from_file(file.path()).unwrap();
        assert_eq!(def.name, "research");
        assert_eq!(def.len(), 2);
        def.validate(&StepRegistry::new()).unwrap();
        assert_eq!(def.descriptors()[1]["task"], json!("summarize {{step.gather.result}}"));
    }

    proptest! {
        #[test]
        fn prop_add_step_grows_by_one(names in proptest::collection::vec("[a-z]{1,8}", 0..6), extra in "[a-z]{1,8}") {
            let registry = StepRegistry::new();
            let mut def = WorkflowDefinition::new("wf");
            for name in &names {
                def = def.add_step(&TaskStep::new(name.clone(), "t")).unwrap();
            }
            let before = def.clone();
            let after = def.add_step(&TaskStep::new(extra, "t")).unwrap();

            prop_assert_eq!(&def, &before);
            prop_assert_eq!(
                after.get_steps(&registry).unwrap().len(),
                def.get_steps(&registry).unwrap().len() + 1
            );
        }
    }
}
