//! Workflow orchestration core
//!
//! stepflow sequences, branches, parallelizes and repeats units of delegated
//! work against a shared execution context:
//!
//! - [`step`] - the five composable step variants and their registry
//! - [`context`] - execution context, `{{key}}` templates and conditions
//! - [`execution`] - router, retrying executor and batch runner
//! - [`definition`] - immutable, serializable workflow definitions
//! - [`engine`] - drives definitions, tracks status, writes checkpoints
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::Map;
//! use stepflow::{EchoWorker, ExecutionLayer, Services, TaskStep, WorkflowDefinition, WorkflowEngine};
//!
//! # async fn demo() -> stepflow::Result<()> {
//! let layer = Arc::new(ExecutionLayer::default());
//! layer.register_worker("echo", Arc::new(EchoWorker));
//!
//! let definition = WorkflowDefinition::new("hello")
//!     .add_step(&TaskStep::new("greet", "Say hello to {{user}}"))?;
//!
//! let engine = WorkflowEngine::new(Arc::new(Services::new(layer)));
//! let mut input = Map::new();
//! input.insert("user".into(), "ada".into());
//! let workflow = engine.execute(&definition, input).await;
//! println!("{}", workflow.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod execution;
pub mod step;
pub mod store;
pub mod testing;
pub mod workflow;

pub use config::{EngineConfig, ExecutionConfig, StepflowConfig};
pub use context::{ExecutionContext, Services};
pub use definition::WorkflowDefinition;
pub use engine::WorkflowEngine;
pub use error::{Result, StepflowError};
pub use execution::{
    EchoWorker, ExecutionLayer, RetryPolicy, Router, RoutingStrategy, TargetProfile, WorkOutcome,
    WorkStatus, WorkUnit, Worker, WorkerFactory,
};
pub use step::{
    ConditionalStep, LoopStep, ParallelStep, ProcessingFn, ProcessingStep, StepRegistry,
    StepResult, TaskStep, WorkflowStep,
};
pub use store::{Entity, InMemoryRepository, Repository};
pub use workflow::{Workflow, WorkflowStatus};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate version string
pub fn version() -> &'static str {
    VERSION
}
