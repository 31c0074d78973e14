//! Engine and execution-layer settings

use crate::error::{Result, StepflowError};
use crate::execution::{RetryPolicy, RoutingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level stepflow configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepflowConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl StepflowConfig {
    /// Load from a YAML (`.yaml`/`.yml`) or TOML (`.toml`) file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    StepflowError::Config(format!("Failed to read config file {:?}: {}", path, e))
                })?;
                toml::from_str(&content).map_err(|e| {
                    StepflowError::Config(format!("Failed to parse TOML file {:?}: {}", path, e))
                })?
            }
            _ => super::loader::load_yaml_config(path)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.engine.checkpoint_interval == 0 {
            return Err(StepflowError::Config(
                "engine.checkpoint_interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Workflow engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Write advisory checkpoints
    #[serde(default = "default_true")]
    pub enable_checkpoints: bool,

    /// Checkpoint after every N completed top-level steps
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,

    /// Continue an interrupted run from its latest checkpoint
    #[serde(default)]
    pub resume_from_checkpoint: bool,

    /// Step name -> target id, seeded into the context as
    /// `workflow.target_overrides`
    #[serde(default)]
    pub target_overrides: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_checkpoints: true,
            checkpoint_interval: default_checkpoint_interval(),
            resume_from_checkpoint: false,
            target_overrides: HashMap::new(),
        }
    }
}

/// Execution layer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Concurrency limit for batch runs
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Default retries for `run_with_retry`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Default pause between retries
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub routing_strategy: RoutingStrategy,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            routing_strategy: RoutingStrategy::default(),
        }
    }
}

impl ExecutionConfig {
    /// Default retry policy derived from these settings
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_interval() -> usize {
    3
}

fn default_max_concurrent() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_defaults() {
        let config = StepflowConfig::default();
        assert!(config.engine.enable_checkpoints);
        assert_eq!(config.engine.checkpoint_interval, 3);
        assert!(!config.engine.resume_from_checkpoint);
        assert_eq!(config.execution.max_concurrent, 5);
        assert_eq!(config.execution.max_retries, 3);
        assert_eq!(config.execution.retry_delay_ms, 1000);
        assert_eq!(config.execution.routing_strategy, RoutingStrategy::RoundRobin);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut file = Builder::new().suffix(".yaml").tempfile()?;
        write!(
            file,
            r#"
engine:
  checkpoint_interval: 5
  target_overrides:
    Summarize: writer
execution:
  routing_strategy: content_match
"#
        )?;

        let config = StepflowConfig::from_file(file.path())?;
        assert_eq!(config.engine.checkpoint_interval, 5);
        assert!(config.engine.enable_checkpoints);
        assert_eq!(
            config.engine.target_overrides.get("Summarize").map(String::as_str),
            Some("writer")
        );
        assert_eq!(config.execution.routing_strategy, RoutingStrategy::ContentMatch);
        assert_eq!(config.execution.max_retries, 3);
        Ok(())
    }

    #[test]
    fn test_toml_config() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut file = Builder::new().suffix(".toml").tempfile()?;
        write!(
            file,
            r#"
[engine]
enable_checkpoints = false

[execution]
max_concurrent = 2
retry_delay_ms = 10
"#
        )?;

        let config = StepflowConfig::from_file(file.path())?;
        assert!(!config.engine.enable_checkpoints);
        assert_eq!(config.execution.max_concurrent, 2);
        assert_eq!(config.execution.retry_policy().retry_delay_ms, 10);
        Ok(())
    }

    #[test]
    fn test_zero_checkpoint_interval_rejected() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut file = Builder::new().suffix(".yaml").tempfile()?;
        write!(file, "engine:\n  checkpoint_interval: 0\n")?;

        let result = StepflowConfig::from_file(file.path());
        assert!(matches!(result, Err(StepflowError::Config(_))));
        Ok(())
    }
}
