//! Error types for the stepflow crate

use stepflow_checkpoint::CheckpointError;
use thiserror::Error;

/// Errors that can occur while building or running workflows
#[derive(Debug, Error)]
pub enum StepflowError {
    /// Step descriptor names a variant that is not registered
    #[error("Unknown step type: {0}")]
    UnknownStepType(String),

    /// Step descriptor is malformed or references unknown functions
    #[error("Failed to deserialize step: {0}")]
    Deserialization(String),

    /// Step type or processing function registered twice
    #[error("Already registered: {0}")]
    DuplicateRegistration(String),

    /// Delegated work unit not found
    #[error("Work unit not found: {0}")]
    WorkNotFound(String),

    /// Execution target not found
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    /// Router has no targets to choose from
    #[error("No execution target available for work '{0}'")]
    NoTargetAvailable(String),

    /// Invalid workflow status transition
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Persistence layer failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Checkpoint backend failure
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Configuration loading or validation failure
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker reported a failure
    #[error("Worker error: {0}")]
    Worker(String),

    /// A step panicked while executing
    #[error("Step panicked: {0}")]
    Panicked(String),

    /// Workflow record not found
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Workflow definition not found
    #[error("Workflow definition not found: {0}")]
    DefinitionNotFound(String),

    /// General error
    #[error("Stepflow error: {0}")]
    General(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for stepflow operations
pub type Result<T> = std::result::Result<T, StepflowError>;
