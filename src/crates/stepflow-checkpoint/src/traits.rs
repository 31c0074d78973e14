//! Checkpoint storage trait
//!
//! [`Checkpointer`] is the seam between the workflow engine and whatever
//! backend keeps checkpoints. Checkpoints are advisory: the engine treats every
//! error returned here as non-fatal.

use crate::checkpoint::{Checkpoint, CheckpointId, CheckpointMetadata, CheckpointSummary};
use crate::error::Result;
use async_trait::async_trait;

/// Backend for creating, restoring and listing checkpoints
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Store a new checkpoint and return its id
    async fn create_checkpoint(
        &self,
        name: &str,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointId>;

    /// Load a checkpoint by id
    ///
    /// Returns [`CheckpointError::NotFound`](crate::CheckpointError::NotFound)
    /// when the id is unknown.
    async fn restore_checkpoint(&self, id: &str) -> Result<Checkpoint>;

    /// List all checkpoints, oldest first
    async fn list_checkpoints(&self) -> Result<Vec<CheckpointSummary>>;

    /// Find the most recent checkpoint whose name starts with `prefix`
    async fn find_latest(&self, prefix: &str) -> Result<Option<Checkpoint>> {
        let latest = self
            .list_checkpoints()
            .await?
            .into_iter()
            .filter(|summary| summary.name.starts_with(prefix))
            .last();

        match latest {
            Some(summary) => Ok(Some(self.restore_checkpoint(&summary.id).await?)),
            None => Ok(None),
        }
    }
}
