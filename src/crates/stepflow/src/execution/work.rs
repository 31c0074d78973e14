//! Delegated work units and the workers that perform them

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Work unit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    /// Created, not yet dispatched
    #[default]
    Pending,
    /// A worker is performing it
    Running,
    /// Worker returned output
    Completed,
    /// Worker returned an error
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for WorkStatus {
    fn from(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// A unit of delegated work
///
/// Created by the execution layer for every task a step dispatches. The
/// record is updated on each run attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Unique work identifier (UUID string)
    pub id: String,

    /// Short name, usually the dispatching step's name
    pub name: String,

    /// Instruction for the worker (already template-resolved)
    pub description: String,

    /// Structured input
    #[serde(default)]
    pub input: Value,

    /// Current status
    pub status: WorkStatus,

    /// Capabilities a target must have to take this work
    #[serde(default)]
    pub required_capabilities: Vec<String>,

    /// Target that last ran this work
    pub target: Option<String>,

    /// Workflow execution this work belongs to
    pub workflow_id: Option<String>,

    /// Worker output of the last successful attempt
    pub output: Option<Value>,

    /// Error of the last failed attempt
    pub error: Option<String>,

    /// Number of run attempts so far
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkUnit {
    /// Create a new pending work unit
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            input: Value::Null,
            status: WorkStatus::Pending,
            required_capabilities: Vec::new(),
            target: None,
            workflow_id: None,
            output: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set structured input
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Require capabilities from the selected target
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    /// Mark as running on `target`
    pub fn mark_running(&mut self, target: &str, workflow_id: Option<&str>) {
        self.status = WorkStatus::Running;
        self.target = Some(target.to_string());
        if let Some(id) = workflow_id {
            self.workflow_id = Some(id.to_string());
        }
        self.attempts += 1;
        self.updated_at = Utc::now();
    }

    /// Mark as completed with output
    pub fn mark_completed(&mut self, output: Value) {
        self.status = WorkStatus::Completed;
        self.output = Some(output);
        self.error = None;
        self.updated_at = Utc::now();
    }

    /// Mark as failed with error
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = WorkStatus::Failed;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
    }
}

/// Result of running a work unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOutcome {
    pub work_id: String,
    pub status: WorkStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl WorkOutcome {
    pub fn completed(work_id: impl Into<String>, output: Value) -> Self {
        Self {
            work_id: work_id.into(),
            status: WorkStatus::Completed,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(work_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            work_id: work_id.into(),
            status: WorkStatus::Failed,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == WorkStatus::Completed
    }
}

/// Something that performs delegated work
#[async_trait]
pub trait Worker: Send + Sync {
    /// Perform the work and return its output
    async fn perform(&self, work: &WorkUnit) -> Result<Value>;
}

/// Creates workers for an agent type on first use
pub trait WorkerFactory: Send + Sync {
    fn create(&self, agent_type: &str) -> Result<Arc<dyn Worker>>;
}

impl<F> WorkerFactory for F
where
    F: Fn(&str) -> Result<Arc<dyn Worker>> + Send + Sync,
{
    fn create(&self, agent_type: &str) -> Result<Arc<dyn Worker>> {
        self(agent_type)
    }
}

/// Worker that returns the work description as its output
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoWorker;

#[async_trait]
impl Worker for EchoWorker {
    async fn perform(&self, work: &WorkUnit) -> Result<Value> {
        Ok(Value::String(work.description.clone()))
    }
}
