//! In-memory checkpoint storage for development and testing
//!
//! [`InMemoryCheckpointer`] keeps every checkpoint in an `Arc<RwLock<Vec>>`
//! in insertion order. Data is lost when the process exits.

use crate::checkpoint::{Checkpoint, CheckpointId, CheckpointMetadata, CheckpointSummary};
use crate::error::{CheckpointError, Result};
use crate::traits::Checkpointer;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory checkpointer
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointer {
    storage: Arc<RwLock<Vec<Checkpoint>>>,
}

impl InMemoryCheckpointer {
    /// Create a new empty checkpointer
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all checkpoints
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }

    /// Number of stored checkpoints
    pub async fn count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// All checkpoints recorded for one workflow record, oldest first
    pub async fn for_workflow(&self, workflow_id: &str) -> Vec<Checkpoint> {
        self.storage
            .read()
            .await
            .iter()
            .filter(|checkpoint| checkpoint.metadata.workflow_id == workflow_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn create_checkpoint(
        &self,
        name: &str,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointId> {
        if name.is_empty() {
            return Err(CheckpointError::Invalid(
                "checkpoint name must not be empty".to_string(),
            ));
        }

        let checkpoint = Checkpoint::new(name, metadata);
        let id = checkpoint.id.clone();

        tracing::debug!(
            checkpoint_id = %id,
            name = %name,
            stage = %checkpoint.metadata.stage,
            "Checkpoint created"
        );

        self.storage.write().await.push(checkpoint);
        Ok(id)
    }

    async fn restore_checkpoint(&self, id: &str) -> Result<Checkpoint> {
        self.storage
            .read()
            .await
            .iter()
            .find(|checkpoint| checkpoint.id == id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(id.to_string()))
    }

    async fn list_checkpoints(&self) -> Result<Vec<CheckpointSummary>> {
        Ok(self
            .storage
            .read()
            .await
            .iter()
            .map(Checkpoint::summary)
            .collect())
    }
}
