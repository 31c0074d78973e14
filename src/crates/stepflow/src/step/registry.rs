//! Step registry: descriptor `type` names to step constructors
//!
//! Workflow definitions store steps as JSON descriptors. The registry maps
//! each descriptor's `type` field to a constructor and also holds the named
//! processing functions that `processing` descriptors refer to.

use super::{ConditionalStep, LoopStep, ParallelStep, ProcessingFn, ProcessingStep, TaskStep, WorkflowStep};
use crate::error::{Result, StepflowError};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a step from its descriptor; nested steps go back through the registry
pub type StepConstructor =
    Arc<dyn Fn(&Value, &StepRegistry) -> Result<Arc<dyn WorkflowStep>> + Send + Sync>;

/// Thread-safe registry of step constructors and processing functions
#[derive(Clone)]
pub struct StepRegistry {
    constructors: Arc<RwLock<HashMap<String, StepConstructor>>>,
    functions: Arc<RwLock<HashMap<String, ProcessingFn>>>,
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("types", &self.registered_types())
            .field("functions", &self.functions.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StepRegistry {
    /// Create a registry with the built-in step types registered
    pub fn new() -> Self {
        let mut constructors: HashMap<String, StepConstructor> = HashMap::new();
        constructors.insert("task".to_string(), Arc::new(TaskStep::from_descriptor));
        constructors.insert(
            "conditional".to_string(),
            Arc::new(ConditionalStep::from_descriptor),
        );
        constructors.insert("parallel".to_string(), Arc::new(ParallelStep::from_descriptor));
        constructors.insert("loop".to_string(), Arc::new(LoopStep::from_descriptor));
        constructors.insert(
            "processing".to_string(),
            Arc::new(ProcessingStep::from_descriptor),
        );

        Self {
            constructors: Arc::new(RwLock::new(constructors)),
            functions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a constructor for a custom step type
    ///
    /// # Arguments
    /// * `step_type` - Value of the descriptor's `type` field
    /// * `constructor` - Builds the step from its descriptor
    ///
    /// # Returns
    /// * `Err(DuplicateRegistration)` if the type is already registered
    pub fn register(&self, step_type: impl Into<String>, constructor: StepConstructor) -> Result<()> {
        let step_type = step_type.into();
        let mut constructors = self.constructors.write();
        if constructors.contains_key(&step_type) {
            return Err(StepflowError::DuplicateRegistration(format!(
                "step type '{}'",
                step_type
            )));
        }
        constructors.insert(step_type, constructor);
        Ok(())
    }

    /// Register a named processing function
    pub fn register_function(&self, name: impl Into<String>, function: ProcessingFn) -> Result<()> {
        let name = name.into();
        let mut functions = self.functions.write();
        if functions.contains_key(&name) {
            return Err(StepflowError::DuplicateRegistration(format!(
                "processing function '{}'",
                name
            )));
        }
        functions.insert(name, function);
        Ok(())
    }

    pub fn function(&self, name: &str) -> Option<ProcessingFn> {
        self.functions.read().get(name).cloned()
    }

    /// Registered step type names, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.constructors.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Build a step from a descriptor
    ///
    /// Nested descriptors are resolved recursively through this registry.
    pub fn deserialize(&self, descriptor: &Value) -> Result<Arc<dyn WorkflowStep>> {
        let step_type = descriptor
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StepflowError::Deserialization("step descriptor has no 'type' field".to_string())
            })?;

        // clone out so nested deserialization can take the lock again
        let constructor = self
            .constructors
            .read()
            .get(step_type)
            .cloned()
            .ok_or_else(|| StepflowError::UnknownStepType(step_type.to_string()))?;

        constructor(descriptor, self)
    }
}
