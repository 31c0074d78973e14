//! Checkpoint data types
//!
//! A checkpoint is a named, advisory snapshot of a workflow execution. It is
//! tagged with the workflow id and a stage label (`start`, `step_5`, `error`,
//! `complete`, ...) and carries the serialized execution context together with
//! the index of the next step to run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Checkpoint ID type
pub type CheckpointId = String;

/// Metadata associated with a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointMetadata {
    /// Workflow record this checkpoint belongs to
    pub workflow_id: String,

    /// Stage label (`start`, `step_<n>`, `paused`, `error`, `complete`)
    pub stage: String,

    /// Index of the next top-level step to execute on resume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step_index: Option<usize>,

    /// Serialized execution state (context data)
    #[serde(default)]
    pub state: Value,

    /// Additional custom metadata
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl CheckpointMetadata {
    /// Create metadata for a workflow stage
    pub fn new(workflow_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            stage: stage.into(),
            ..Default::default()
        }
    }

    /// Set the index of the next step to run
    pub fn with_next_step(mut self, index: usize) -> Self {
        self.next_step_index = Some(index);
        self
    }

    /// Attach the serialized execution state
    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }

    /// Add custom metadata
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// State snapshot at a given point in time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Unique checkpoint identifier
    pub id: CheckpointId,

    /// Checkpoint name, e.g. `<definition name>:<stage>`
    pub name: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Snapshot metadata and state
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Create a new checkpoint with a fresh id
    pub fn new(name: impl Into<String>, metadata: CheckpointMetadata) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            created_at: Utc::now(),
            metadata,
        }
    }

    /// Summary view of this checkpoint
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            workflow_id: self.metadata.workflow_id.clone(),
            stage: self.metadata.stage.clone(),
            created_at: self.created_at,
        }
    }
}

/// Lightweight listing entry (no state payload)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointSummary {
    pub id: CheckpointId,
    pub name: String,
    pub workflow_id: String,
    pub stage: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_builder() {
        let metadata = CheckpointMetadata::new("wf-1", "step_2")
            .with_next_step(3)
            .with_state(json!({"counter": 1}))
            .with_extra("reason", json!("interval"));

        assert_eq!(metadata.workflow_id, "wf-1");
        assert_eq!(metadata.stage, "step_2");
        assert_eq!(metadata.next_step_index, Some(3));
        assert_eq!(metadata.state["counter"], 1);
        assert_eq!(metadata.extra.get("reason"), Some(&json!("interval")));
    }

    #[test]
    fn test_checkpoint_serialization_flattens_extra() {
        let checkpoint = Checkpoint::new(
            "pipeline:start",
            CheckpointMetadata::new("wf-1", "start").with_extra("note", json!("x")),
        );

        let value = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(value["metadata"]["note"], "x");
        assert!(value["metadata"].get("next_step_index").is_none());

        let back: Checkpoint = serde_json::from_value(value).unwrap();
        assert_eq!(back, checkpoint);
    }

    #[test]
    fn test_summary_drops_state() {
        let checkpoint = Checkpoint::new(
            "pipeline:complete",
            CheckpointMetadata::new("wf-9", "complete").with_state(json!({"big": [1, 2, 3]})),
        );
        let summary = checkpoint.summary();
        assert_eq!(summary.id, checkpoint.id);
        assert_eq!(summary.workflow_id, "wf-9");
        assert_eq!(summary.stage, "complete");
    }
}
