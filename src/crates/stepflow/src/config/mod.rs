//! Configuration for the engine and execution layer
//!
//! Settings are read from YAML (with `$include` and `${ENV:default}` support)
//! or TOML files. Workflow definition files share the YAML loader.

pub mod loader;
pub mod settings;

pub use loader::{load_document, load_yaml_config, load_yaml_file, yaml_to_json};
pub use settings::{EngineConfig, ExecutionConfig, StepflowConfig};
