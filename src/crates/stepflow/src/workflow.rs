//! Workflow execution records
//!
//! A [`Workflow`] tracks one run of a definition. Only the engine changes its
//! status, and only along the transitions [`WorkflowStatus::can_transition_to`]
//! allows.

use crate::error::{Result, StepflowError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Workflow status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Created, not started yet
    Pending,
    /// Step loop is executing
    Running,
    /// All steps succeeded
    Completed,
    /// A step failed or execution aborted
    Failed,
    /// Stopped on request; resumable from a checkpoint
    Paused,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Allowed moves: pending to running or failed, running to any other
    /// non-pending status, paused back to running or to failed.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Failed)
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for WorkflowStatus {
    fn from(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "paused" => Self::Paused,
            _ => Self::Pending,
        }
    }
}

/// Execution record of one workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier (UUID string)
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Definition this run executes
    pub definition_id: String,

    pub status: WorkflowStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Ids of the work units dispatched by this run, in dispatch order
    #[serde(default)]
    pub task_ids: Vec<String>,

    /// Failure message; set whenever status is failed
    pub error: Option<String>,

    /// Free-form metadata; `context` holds the final context snapshot
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Workflow {
    /// Create a pending workflow record
    pub fn new(name: impl Into<String>, definition_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            definition_id: definition_id.into(),
            status: WorkflowStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            task_ids: Vec::new(),
            error: None,
            metadata: Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn transition(&mut self, next: WorkflowStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(StepflowError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark as running; a record that is already running is left unchanged
    pub fn mark_running(&mut self) -> Result<()> {
        if self.status == WorkflowStatus::Running {
            return Ok(());
        }
        self.transition(WorkflowStatus::Running)?;
        self.started_at.get_or_insert(self.updated_at);
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<()> {
        self.transition(WorkflowStatus::Completed)?;
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Mark as failed; an empty message is replaced so the error is never blank
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(WorkflowStatus::Failed)?;
        let error = error.into();
        self.error = Some(if error.trim().is_empty() {
            "unknown error".to_string()
        } else {
            error
        });
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    pub fn mark_paused(&mut self) -> Result<()> {
        self.transition(WorkflowStatus::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Append a dispatched work id, skipping duplicates
    pub fn add_task_id(&mut self, task_id: impl Into<String>) {
        let task_id = task_id.into();
        if !self.task_ids.contains(&task_id) {
            self.task_ids.push(task_id);
        }
    }

    /// Final context snapshot stored under `metadata.context`
    pub fn context(&self) -> Option<&Map<String, Value>> {
        self.metadata.get("context").and_then(Value::as_object)
    }
}
