//! Integration tests for stepflow-cli
//!
//! These tests verify the CLI commands against definition files on disk:
//! - validation of well-formed and broken definitions
//! - step tree rendering
//! - dry runs with input data and config files

use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use stepflow::WorkflowStatus;
use tempfile::TempDir;

/// Helper function to create a test directory
fn create_test_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Helper function to write a definition with nested steps
fn create_example_yaml(dir: &Path) -> PathBuf {
    let path = dir.join("pipeline.yaml");
    let yaml_content = r#"name: research
description: Gather, review and summarize
steps:
  - type: task
    id: gather
    name: gather
    task: "collect notes on {{topic}}"
    target: researcher
  - type: parallel
    name: review
    max_concurrent: 2
    steps:
      - type: task
        name: critique
        task: "critique {{step.gather.result}}"
        agent_type: critic
      - type: task
        name: fact-check
        task: "check {{step.gather.result}}"
  - type: conditional
    name: gate
    condition: "step.gather.result != ''"
    if_step:
      type: task
      name: summarize
      task: "summary of {{topic}}"
    else_step: null
"#;
    fs::write(&path, yaml_content).expect("Failed to write YAML file");
    path
}

#[test]
fn test_validate_counts_nested_steps() {
    let dir = create_test_dir();
    let path = create_example_yaml(dir.path());

    let report = stepflow_cli::validate(&path).unwrap();
    assert_eq!(report.name, "research");
    assert_eq!(report.top_level_steps, 3);
    assert_eq!(report.total_steps, 6);
    assert_eq!(report.step_types, vec!["conditional", "parallel", "task"]);
}

#[test]
fn test_validate_rejects_unknown_step_type() {
    let dir = create_test_dir();
    let path = dir.path().join("broken.yaml");
    fs::write(
        &path,
        "name: broken\nsteps:\n  - type: teleport\n    name: beam\n",
    )
    .unwrap();

    let err = stepflow_cli::validate(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("Unknown step type: teleport"));
}

#[test]
fn test_validate_missing_file() {
    let dir = create_test_dir();
    assert!(stepflow_cli::validate(&dir.path().join("nope.yaml")).is_err());
}

#[test]
fn test_inspect_renders_tree() {
    let dir = create_test_dir();
    let path = create_example_yaml(dir.path());

    let tree = stepflow_cli::inspect(&path).unwrap();
    assert!(tree.starts_with("research ("));
    assert!(tree.contains("  0. [task] gather"));
    assert!(tree.contains("  1. [parallel] review"));
    assert!(tree.contains("    - [task] critique"));
    assert!(tree.contains("  2. [conditional] gate"));
    assert!(tree.contains("    - [task] summarize"));
}

#[tokio::test]
async fn test_run_dry_runs_with_echo_workers() {
    let dir = create_test_dir();
    let path = create_example_yaml(dir.path());

    let report = stepflow_cli::run(&path, Some(r#"{"topic": "tides"}"#), None)
        .await
        .unwrap();

    let workflow = &report.workflow;
    assert_eq!(workflow.status, WorkflowStatus::Completed, "{:?}", workflow.error);
    assert_eq!(workflow.task_ids.len(), 4);

    let context = workflow.context().unwrap();
    assert_eq!(context["step.gather.result"], json!("collect notes on tides"));
    assert_eq!(
        context["step_results.2"]["output"]["result"],
        json!("summary of tides")
    );

    let names: Vec<_> = report.checkpoints.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names.first(), Some(&"research:start"));
    assert_eq!(names.last(), Some(&"research:complete"));
}

#[tokio::test]
async fn test_run_with_toml_config() {
    let dir = create_test_dir();
    let path = create_example_yaml(dir.path());
    let config = dir.path().join("stepflow.toml");
    fs::write(
        &config,
        r#"
[engine]
enable_checkpoints = false

[execution]
routing_strategy = "load_balanced"
"#,
    )
    .unwrap();

    let report = stepflow_cli::run(&path, Some(r#"{"topic": "tides"}"#), Some(&config))
        .await
        .unwrap();
    assert_eq!(report.workflow.status, WorkflowStatus::Completed);
    assert!(report.checkpoints.is_empty());
}

#[tokio::test]
async fn test_processing_steps_are_no_ops_in_dry_run() {
    let dir = create_test_dir();
    let path = dir.path().join("processing.yaml");
    fs::write(
        &path,
        r#"name: tally
steps:
  - type: processing
    name: count-words
    function: word_count
    extra_data:
      source: "{{topic}}"
  - type: task
    name: report
    task: "report on {{topic}}"
"#,
    )
    .unwrap();

    let report = stepflow_cli::validate(&path).unwrap();
    assert_eq!(report.step_types, vec!["processing", "task"]);

    let run = stepflow_cli::run(&path, Some(r#"{"topic": "tides"}"#), None)
        .await
        .unwrap();
    assert_eq!(run.workflow.status, WorkflowStatus::Completed, "{:?}", run.workflow.error);
    let context = run.workflow.context().unwrap();
    assert_eq!(context["step_results.0"]["success"], json!(true));
    assert!(!context.contains_key("source"));
}

#[tokio::test]
async fn test_run_rejects_non_object_input() {
    let dir = create_test_dir();
    let path = create_example_yaml(dir.path());

    assert!(stepflow_cli::run(&path, Some("[1]"), None).await.is_err());
}
