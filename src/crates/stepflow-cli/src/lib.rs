//! Commands behind the `stepflow` binary
//!
//! Each command loads a workflow definition file (YAML or JSON) and works on
//! the rebuilt step tree. `run` is a dry run: every target and agent type the
//! definition names is served by an [`EchoWorker`], and every processing
//! function it names is a no-op that leaves the context unchanged.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use stepflow::{
    EchoWorker, ProcessingFn, StepflowConfig, Worker, WorkflowDefinition, WorkflowEngine,
    WorkflowStep, Workflow,
};
use stepflow_checkpoint::{CheckpointSummary, Checkpointer, InMemoryCheckpointer};
use tracing::{debug, info};

/// Outcome of `stepflow validate`
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub name: String,
    pub top_level_steps: usize,
    pub total_steps: usize,
    pub step_types: Vec<String>,
}

/// Outcome of `stepflow run`
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub workflow: Workflow,
    pub checkpoints: Vec<CheckpointSummary>,
}

/// Load a definition and rebuild every step
pub fn validate(path: &Path) -> Result<ValidationReport> {
    let definition = load(path)?;
    let engine = dry_run_engine(&definition, &StepflowConfig::default())?;
    definition
        .validate(engine.registry())
        .with_context(|| format!("{} is not a valid workflow", path.display()))?;

    let steps = definition.get_steps(engine.registry())?;
    let mut types = BTreeSet::new();
    let mut total = 0;
    for step in &steps {
        visit(step, &mut |s: &Arc<dyn WorkflowStep>| {
            total += 1;
            types.insert(s.step_type().to_string());
        });
    }

    Ok(ValidationReport {
        name: definition.name,
        top_level_steps: steps.len(),
        total_steps: total,
        step_types: types.into_iter().collect(),
    })
}

/// Render the step tree as indented text
pub fn inspect(path: &Path) -> Result<String> {
    let definition = load(path)?;
    let engine = dry_run_engine(&definition, &StepflowConfig::default())?;
    let steps = definition.get_steps(engine.registry())?;

    let mut out = String::new();
    writeln!(out, "{} ({})", definition.name, definition.id)?;
    if !definition.description.is_empty() {
        writeln!(out, "  {}", definition.description)?;
    }
    for (index, step) in steps.iter().enumerate() {
        render(&mut out, step, 1, Some(index))?;
    }
    Ok(out)
}

/// Dry-run a definition against echo workers
///
/// `input` is a JSON object used as the initial context data.
pub async fn run(path: &Path, input: Option<&str>, config: Option<&Path>) -> Result<RunReport> {
    let definition = load(path)?;
    let config = match config {
        Some(config) => StepflowConfig::from_file(config)
            .with_context(|| format!("failed to load config {}", config.display()))?,
        None => StepflowConfig::default(),
    };
    let initial_data = parse_input(input)?;

    let checkpointer = Arc::new(InMemoryCheckpointer::new());
    let engine = dry_run_engine(&definition, &config)?.with_checkpointer(checkpointer.clone());

    info!(workflow = %definition.name, "Dry-running workflow");
    let workflow = engine.execute(&definition, initial_data).await;
    let checkpoints = checkpointer.list_checkpoints().await?;

    Ok(RunReport {
        workflow,
        checkpoints,
    })
}

fn load(path: &Path) -> Result<WorkflowDefinition> {
    WorkflowDefinition::from_file(path)
        .with_context(|| format!("failed to load workflow definition {}", path.display()))
}

fn parse_input(input: Option<&str>) -> Result<Map<String, Value>> {
    let Some(input) = input else {
        return Ok(Map::new());
    };
    match serde_json::from_str(input).context("--input is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--input must be a JSON object, got {}", other),
    }
}

/// Names a definition refers to that a dry run has to serve
#[derive(Debug, Default)]
struct Referenced {
    targets: BTreeSet<String>,
    agent_types: BTreeSet<String>,
    functions: BTreeSet<String>,
}

/// Engine where every referenced target, agent type and processing function
/// resolves
fn dry_run_engine(definition: &WorkflowDefinition, config: &StepflowConfig) -> Result<WorkflowEngine> {
    let engine = WorkflowEngine::from_config(config);
    let mut names = Referenced::default();
    for descriptor in definition.descriptors() {
        collect_names(descriptor, &mut names);
    }

    for function in &names.functions {
        debug!(function = %function, "Registering no-op processing function");
        engine.registry().register_function(
            function.clone(),
            ProcessingFn::sync(|_: &Map<String, Value>| Ok(None)),
        )?;
    }

    let layer = engine.execution();
    let echo: Arc<dyn Worker> = Arc::new(EchoWorker);
    layer.register_worker("echo", echo.clone());

    names
        .targets
        .extend(config.engine.target_overrides.values().cloned());
    for target in names.targets {
        debug!(target_id = %target, "Registering echo target");
        layer.register_worker(target, echo.clone());
    }
    for agent_type in names.agent_types {
        let worker = echo.clone();
        layer.register_agent_type(
            agent_type,
            Arc::new(move |_: &str| Ok::<_, stepflow::StepflowError>(worker.clone())),
        )?;
    }
    Ok(engine)
}

fn collect_names(value: &Value, names: &mut Referenced) {
    match value {
        Value::Object(map) => {
            if let Some(target) = map.get("target").and_then(Value::as_str) {
                names.targets.insert(target.to_string());
            }
            if let Some(agent_type) = map.get("agent_type").and_then(Value::as_str) {
                names.agent_types.insert(agent_type.to_string());
            }
            if map.get("type").and_then(Value::as_str) == Some("processing") {
                if let Some(function) = map.get("function").and_then(Value::as_str) {
                    names.functions.insert(function.to_string());
                }
            }
            for child in map.values() {
                collect_names(child, names);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_names(item, names);
            }
        }
        _ => {}
    }
}

fn visit(step: &Arc<dyn WorkflowStep>, f: &mut dyn FnMut(&Arc<dyn WorkflowStep>)) {
    f(step);
    for child in step.children() {
        visit(&child, f);
    }
}

fn render(
    out: &mut String,
    step: &Arc<dyn WorkflowStep>,
    depth: usize,
    index: Option<usize>,
) -> std::fmt::Result {
    let indent = "  ".repeat(depth);
    let label = match index {
        Some(index) => format!("{}. ", index),
        None => "- ".to_string(),
    };
    write!(out, "{}{}[{}] {}", indent, label, step.step_type(), step.name())?;
    if !step.description().is_empty() {
        write!(out, ": {}", step.description())?;
    }
    writeln!(out)?;
    for child in step.children() {
        render(out, &child, depth + 1, None)?;
    }
    Ok(())
}
