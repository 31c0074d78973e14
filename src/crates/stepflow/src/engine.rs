//! Workflow engine
//!
//! Drives a [`WorkflowDefinition`] step by step against one
//! [`ExecutionContext`] and keeps the [`Workflow`] record in sync:
//!
//! - top-level steps run strictly in order; only nested steps fan out
//! - after every step its [`StepResult`](crate::step::StepResult) is stored
//!   under `step_results.<index>`
//! - the first failed step fails the workflow and skips the rest
//! - errors and panics inside the loop are caught once and recorded as
//!   `Workflow execution error: ...`
//! - the final context snapshot is always saved in the record's metadata
//!
//! Checkpoints are advisory. They are written at the start, every
//! `checkpoint_interval` steps, on pause, on error and on completion, and a
//! checkpoint failure never changes the outcome. With
//! `resume_from_checkpoint` enabled, an interrupted or paused run continues
//! from the step after its latest checkpoint. A run that this engine is still
//! driving is never picked up a second time.

use crate::config::{EngineConfig, StepflowConfig};
use crate::context::{ExecutionContext, Services};
use crate::definition::WorkflowDefinition;
use crate::error::{Result, StepflowError};
use crate::execution::ExecutionLayer;
use crate::step::{StepRegistry, WorkflowStep};
use crate::store::{InMemoryRepository, Repository};
use crate::workflow::{Workflow, WorkflowStatus};
use chrono::Utc;
use dashmap::DashSet;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use stepflow_checkpoint::{Checkpoint, CheckpointMetadata, Checkpointer};
use tracing::{debug, error, info, warn};

/// Runs workflow definitions and tracks their execution records
pub struct WorkflowEngine {
    services: Arc<Services>,
    registry: StepRegistry,
    workflows: Arc<dyn Repository<Workflow>>,
    definitions: Arc<dyn Repository<WorkflowDefinition>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    config: EngineConfig,
    pause_requests: DashSet<String>,
    /// Workflow ids currently driven by a step loop of this engine
    active: DashSet<String>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("services", &self.services)
            .field("registry", &self.registry)
            .field("checkpoints", &self.checkpointer.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl WorkflowEngine {
    /// Engine with in-memory repositories and no checkpointer
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            registry: StepRegistry::new(),
            workflows: Arc::new(InMemoryRepository::<Workflow>::new()),
            definitions: Arc::new(InMemoryRepository::<WorkflowDefinition>::new()),
            checkpointer: None,
            config: EngineConfig::default(),
            pause_requests: DashSet::new(),
            active: DashSet::new(),
        }
    }

    /// Engine plus a fresh execution layer built from `config`
    pub fn from_config(config: &StepflowConfig) -> Self {
        let layer = Arc::new(ExecutionLayer::new(config.execution.clone()));
        Self::new(Arc::new(Services::new(layer))).with_config(config.engine.clone())
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: StepRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_workflow_repository(mut self, repository: Arc<dyn Repository<Workflow>>) -> Self {
        self.workflows = repository;
        self
    }

    pub fn with_definition_repository(
        mut self,
        repository: Arc<dyn Repository<WorkflowDefinition>>,
    ) -> Self {
        self.definitions = repository;
        self
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn execution(&self) -> &Arc<ExecutionLayer> {
        self.services.execution()
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Store a definition so it can be run with [`execute_by_id`](Self::execute_by_id)
    pub async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<String> {
        self.definitions.save(definition).await
    }

    /// Run a stored definition
    pub async fn execute_by_id(&self, definition_id: &str, initial_data: Map<String, Value>) -> Result<Workflow> {
        let definition = self
            .definitions
            .find_by_id(definition_id)
            .await?
            .ok_or_else(|| StepflowError::DefinitionNotFound(definition_id.to_string()))?;
        Ok(self.execute(&definition, initial_data).await)
    }

    /// Run a definition to completion, failure or pause
    ///
    /// Never fails: every problem is reported through the returned record's
    /// status and error.
    pub async fn execute(&self, definition: &WorkflowDefinition, initial_data: Map<String, Value>) -> Workflow {
        if self.config.resume_from_checkpoint {
            if let Some((workflow, checkpoint)) = self.find_resumable(definition).await {
                return self.resume(definition, workflow, checkpoint).await;
            }
        }

        let mut workflow =
            Workflow::new(definition.name.clone(), definition.id.clone())
                .with_description(definition.description.clone());
        self.active.insert(workflow.id.clone());
        let mut context = self.seed_context(&workflow, initial_data);

        info!(
            workflow_id = %workflow.id,
            definition = %definition.name,
            steps = definition.len(),
            "Starting workflow"
        );

        let outcome = self.start(definition, &mut workflow, &mut context).await;
        self.finish(workflow, context, outcome).await
    }

    /// Ask a running workflow to pause before its next step
    pub async fn pause(&self, workflow_id: &str) -> Result<()> {
        let workflow = self
            .workflows
            .find_by_id(workflow_id)
            .await?
            .ok_or_else(|| StepflowError::WorkflowNotFound(workflow_id.to_string()))?;

        if workflow.status != WorkflowStatus::Running {
            return Err(StepflowError::InvalidStateTransition {
                from: workflow.status.to_string(),
                to: WorkflowStatus::Paused.to_string(),
            });
        }

        info!(workflow_id = %workflow_id, "Pause requested");
        self.pause_requests.insert(workflow_id.to_string());
        Ok(())
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>> {
        self.workflows.find_by_id(workflow_id).await
    }

    /// All workflow records, optionally only those in `status`
    pub async fn list_workflows(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>> {
        let filter = status.map(|status| {
            let mut filter = Map::new();
            filter.insert("status".to_string(), json!(status.as_str()));
            filter
        });
        self.workflows.find_all(filter.as_ref()).await
    }

    fn seed_context(&self, workflow: &Workflow, initial_data: Map<String, Value>) -> ExecutionContext {
        let mut context =
            ExecutionContext::new(workflow.id.clone(), self.services.clone()).with_data(initial_data);
        context.set("workflow.name", json!(workflow.name));
        context.set("workflow.id", json!(workflow.id));
        context.set("workflow.start_time", json!(Utc::now().to_rfc3339()));
        if !self.config.target_overrides.is_empty() && !context.contains("workflow.target_overrides") {
            context.set(
                "workflow.target_overrides",
                json!(self.config.target_overrides),
            );
        }
        context
    }

    async fn start(
        &self,
        definition: &WorkflowDefinition,
        workflow: &mut Workflow,
        context: &mut ExecutionContext,
    ) -> Result<()> {
        workflow.mark_running()?;
        self.workflows.save(workflow).await?;
        self.checkpoint(definition, workflow, "start", Some(0), context)
            .await;

        let steps = definition.get_steps(&self.registry)?;
        self.run_steps(definition, workflow, &steps, context, 0).await
    }

    async fn resume(
        &self,
        definition: &WorkflowDefinition,
        mut workflow: Workflow,
        checkpoint: Checkpoint,
    ) -> Workflow {
        let next = checkpoint.metadata.next_step_index.unwrap_or(0);
        let state = match checkpoint.metadata.state {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let mut context = ExecutionContext::new(workflow.id.clone(), self.services.clone()).with_data(state);

        info!(
            workflow_id = %workflow.id,
            checkpoint = %checkpoint.name,
            next_step = next,
            "Resuming workflow from checkpoint"
        );

        let outcome = self
            .continue_from(definition, &mut workflow, &mut context, next)
            .await;
        self.finish(workflow, context, outcome).await
    }

    async fn continue_from(
        &self,
        definition: &WorkflowDefinition,
        workflow: &mut Workflow,
        context: &mut ExecutionContext,
        next: usize,
    ) -> Result<()> {
        workflow.mark_running()?;
        self.workflows.save(workflow).await?;
        let steps = definition.get_steps(&self.registry)?;
        self.run_steps(definition, workflow, &steps, context, next)
            .await
    }

    /// Newest checkpoint of this definition whose record is still running or
    /// paused and not driven by a live step loop
    ///
    /// The returned record is claimed in `active`; [`finish`](Self::finish)
    /// releases it.
    async fn find_resumable(&self, definition: &WorkflowDefinition) -> Option<(Workflow, Checkpoint)> {
        let checkpointer = self.checkpointer.as_ref()?;
        let prefix = format!("{}:", definition.name);

        let summaries = match checkpointer.list_checkpoints().await {
            Ok(summaries) => summaries,
            Err(e) => {
                warn!(definition = %definition.name, error = %e, "Could not list checkpoints");
                return None;
            }
        };

        for summary in summaries.iter().rev().filter(|s| s.name.starts_with(&prefix)) {
            let workflow = match self.workflows.find_by_id(&summary.workflow_id).await {
                Ok(Some(workflow)) => workflow,
                _ => continue,
            };
            if !matches!(workflow.status, WorkflowStatus::Running | WorkflowStatus::Paused) {
                continue;
            }
            if !self.active.insert(workflow.id.clone()) {
                debug!(workflow_id = %workflow.id, "Workflow is still running, not resuming");
                continue;
            }

            match checkpointer.restore_checkpoint(&summary.id).await {
                Ok(checkpoint) if checkpoint.metadata.next_step_index.is_some() => {
                    return Some((workflow, checkpoint))
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(checkpoint = %summary.name, error = %e, "Could not restore checkpoint");
                }
            }
            self.active.remove(&workflow.id);
        }

        debug!(definition = %definition.name, "No resumable checkpoint");
        None
    }

    async fn run_steps(
        &self,
        definition: &WorkflowDefinition,
        workflow: &mut Workflow,
        steps: &[Arc<dyn WorkflowStep>],
        context: &mut ExecutionContext,
        start: usize,
    ) -> Result<()> {
        let interval = self.config.checkpoint_interval.max(1);

        for (index, step) in steps.iter().enumerate().skip(start) {
            if self.pause_requests.remove(&workflow.id).is_some() {
                workflow.mark_paused()?;
                info!(workflow_id = %workflow.id, next_step = index, "Workflow paused");
                self.checkpoint(definition, workflow, "paused", Some(index), context)
                    .await;
                return Ok(());
            }

            debug!(
                workflow_id = %workflow.id,
                step = %step.name(),
                index,
                step_type = step.step_type(),
                "Executing step"
            );

            let result = AssertUnwindSafe(step.execute(context))
                .catch_unwind()
                .await
                .map_err(|payload| StepflowError::Panicked(panic_message(payload.as_ref())))?;

            context.set(format!("step_results.{}", index), serde_json::to_value(&result)?);
            if let Some(task_id) = &result.task_id {
                workflow.add_task_id(task_id.clone());
            }
            if let Some(nested) = result.output.get("task_ids").and_then(Value::as_array) {
                for task_id in nested.iter().filter_map(Value::as_str) {
                    workflow.add_task_id(task_id);
                }
            }

            if !result.success {
                let message = format!("Step '{}' failed: {}", step.name(), result.error_message());
                error!(workflow_id = %workflow.id, step = %step.name(), error = %result.error_message(), "Step failed");
                workflow.mark_failed(message)?;
                self.checkpoint(definition, workflow, "error", Some(index), context)
                    .await;
                return Ok(());
            }

            self.workflows.save(workflow).await?;

            if (index + 1) % interval == 0 {
                let stage = format!("step_{}", index);
                self.checkpoint(definition, workflow, &stage, Some(index + 1), context)
                    .await;
            }
        }

        workflow.mark_completed()?;
        info!(workflow_id = %workflow.id, tasks = workflow.task_ids.len(), "Workflow completed");
        self.checkpoint(definition, workflow, "complete", None, context)
            .await;
        Ok(())
    }

    /// Apply the catch-all, persist the final context and store the record
    async fn finish(
        &self,
        mut workflow: Workflow,
        mut context: ExecutionContext,
        outcome: Result<()>,
    ) -> Workflow {
        if let Err(e) = outcome {
            let message = format!("Workflow execution error: {}", e);
            error!(workflow_id = %workflow.id, error = %e, "Workflow execution aborted");
            context.set(
                "workflow.error",
                json!({
                    "message": e.to_string(),
                    "kind": error_kind(&e),
                    "failed_at": Utc::now().to_rfc3339(),
                }),
            );
            if let Err(transition) = workflow.mark_failed(message.clone()) {
                warn!(workflow_id = %workflow.id, error = %transition, "Could not mark workflow failed");
                workflow.error = Some(message);
            }
        }

        self.pause_requests.remove(&workflow.id);
        workflow
            .metadata
            .insert("context".to_string(), context.snapshot());

        if let Err(e) = self.workflows.save(&workflow).await {
            error!(workflow_id = %workflow.id, error = %e, "Failed to persist workflow record");
        }
        // released only once the final status is stored
        self.active.remove(&workflow.id);
        workflow
    }

    /// Best-effort checkpoint named `<definition name>:<stage>`
    async fn checkpoint(
        &self,
        definition: &WorkflowDefinition,
        workflow: &Workflow,
        stage: &str,
        next_step_index: Option<usize>,
        context: &ExecutionContext,
    ) {
        if !self.config.enable_checkpoints {
            return;
        }
        let Some(checkpointer) = &self.checkpointer else {
            return;
        };

        let mut metadata = CheckpointMetadata::new(workflow.id.clone(), stage)
            .with_state(context.snapshot())
            .with_extra("status", json!(workflow.status.as_str()));
        if let Some(index) = next_step_index {
            metadata = metadata.with_next_step(index);
        }

        let name = format!("{}:{}", definition.name, stage);
        match checkpointer.create_checkpoint(&name, metadata).await {
            Ok(id) => debug!(workflow_id = %workflow.id, checkpoint = %name, id = %id, "Checkpoint written"),
            Err(e) => warn!(workflow_id = %workflow.id, checkpoint = %name, error = %e, "Checkpoint failed, continuing"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn error_kind(error: &StepflowError) -> &'static str {
    match error {
        StepflowError::Panicked(_) => "panic",
        StepflowError::Persistence(_) => "persistence",
        StepflowError::Deserialization(_) | StepflowError::UnknownStepType(_) => "deserialization",
        StepflowError::InvalidStateTransition { .. } => "state",
        StepflowError::Serialization(_) => "serialization",
        _ => "internal",
    }
}
