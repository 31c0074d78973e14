//! # stepflow-checkpoint
//!
//! Checkpoint abstractions for stepflow workflow executions.
//!
//! Checkpoints are advisory snapshots taken by the workflow engine at the start
//! of a run, every N steps, on pause, on error and on completion. Each one is
//! named `<definition name>:<stage>` and carries the serialized execution
//! context plus the index of the next step, which is enough to resume a run.
//!
//! - [`Checkpointer`] - storage backend trait
//! - [`InMemoryCheckpointer`] - reference backend for tests and development
//! - [`Checkpoint`] / [`CheckpointMetadata`] - snapshot data

pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod traits;

pub use checkpoint::{Checkpoint, CheckpointId, CheckpointMetadata, CheckpointSummary};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointer;
pub use traits::Checkpointer;
