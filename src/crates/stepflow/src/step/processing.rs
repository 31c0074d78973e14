//! Processing step: apply a named function to the context data

use super::{required_str, StepMeta, StepRegistry, StepResult, WorkflowStep};
use crate::context::ExecutionContext;
use crate::error::{Result, StepflowError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

type SyncFn = dyn Fn(&Map<String, Value>) -> Result<Option<Map<String, Value>>> + Send + Sync;
type AsyncFn =
    dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<Option<Map<String, Value>>>> + Send + Sync;

/// A data transformation, either plain or async
///
/// The function receives the merged input mapping and returns new entries
/// for the context, or `None` for nothing.
#[derive(Clone)]
pub enum ProcessingFn {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

impl ProcessingFn {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<Option<Map<String, Value>>> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn new_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Map<String, Value>>>> + Send + 'static,
    {
        Self::Async(Arc::new(move |input| Box::pin(f(input))))
    }

    pub async fn call(&self, input: Map<String, Value>) -> Result<Option<Map<String, Value>>> {
        match self {
            Self::Sync(f) => f(&input),
            Self::Async(f) => f(input).await,
        }
    }
}

impl fmt::Debug for ProcessingFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("ProcessingFn::Sync"),
            Self::Async(_) => f.write_str("ProcessingFn::Async"),
        }
    }
}

/// Calls a [`ProcessingFn`] with the context data overlaid by `extra_data`
///
/// `extra_data` values are template-resolved first. The returned mapping is
/// stored under `step.<id>.result` and merged into the context.
#[derive(Debug, Clone)]
pub struct ProcessingStep {
    meta: StepMeta,
    function_name: String,
    function: ProcessingFn,
    extra_data: Map<String, Value>,
}

impl ProcessingStep {
    pub fn new(
        name: impl Into<String>,
        function_name: impl Into<String>,
        function: ProcessingFn,
    ) -> Self {
        Self {
            meta: StepMeta::new(name),
            function_name: function_name.into(),
            function,
            extra_data: Map::new(),
        }
    }

    /// Step around a plain function
    pub fn sync<F>(name: impl Into<String>, function_name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<Option<Map<String, Value>>> + Send + Sync + 'static,
    {
        Self::new(name, function_name, ProcessingFn::sync(f))
    }

    /// Step around an async function
    pub fn new_async<F, Fut>(name: impl Into<String>, function_name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Map<String, Value>>>> + Send + 'static,
    {
        Self::new(name, function_name, ProcessingFn::new_async(f))
    }

    pub fn with_extra_data(mut self, extra_data: Map<String, Value>) -> Self {
        self.extra_data = extra_data;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.meta.description = description.into();
        self
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub(crate) fn from_descriptor(
        descriptor: &Value,
        registry: &StepRegistry,
    ) -> Result<Arc<dyn WorkflowStep>> {
        let meta = StepMeta::from_descriptor(descriptor)?;
        let function_name = required_str(descriptor, "function", "processing")?.to_string();
        let function = registry.function(&function_name).ok_or_else(|| {
            StepflowError::Deserialization(format!(
                "processing function '{}' is not registered",
                function_name
            ))
        })?;
        let extra_data = match descriptor.get("extra_data") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(StepflowError::Deserialization(format!(
                    "processing step extra_data must be an object, got {}",
                    other
                )))
            }
        };

        Ok(Arc::new(Self {
            meta,
            function_name,
            function,
            extra_data,
        }))
    }
}

#[async_trait]
impl WorkflowStep for ProcessingStep {
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
        "processing"
    }

    async fn execute(&self, context: &mut ExecutionContext) -> StepResult {
        let mut input = context.data().clone();
        for (key, value) in &self.extra_data {
            input.insert(key.clone(), context.resolve_value(value));
        }

        match self.function.call(input).await {
            Ok(output) => {
                let output = output.unwrap_or_default();
                context.set_step_value(&self.meta.id, "result", Value::Object(output.clone()));
                context.merge(output.clone());
                StepResult::ok(output)
            }
            Err(e) => {
                warn!(step = %self.meta.name, function = %self.function_name, error = %e, "Processing failed");
                StepResult::failed(format!("Processing '{}' failed: {}", self.function_name, e))
            }
        }
    }

    fn to_descriptor(&self) -> Result<Value> {
        let mut map = self.meta.descriptor(self.step_type());
        map.insert("function".to_string(), json!(self.function_name));
        map.insert("extra_data".to_string(), Value::Object(self.extra_data.clone()));
        Ok(Value::Object(map))
    }
}
