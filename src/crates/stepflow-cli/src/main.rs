//! stepflow CLI - validate, inspect and dry-run workflow definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stepflow::WorkflowStatus;

#[derive(Parser)]
#[command(name = "stepflow")]
#[command(about = "stepflow - workflow orchestration core", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a definition and check that every step deserializes
    Validate {
        /// Path to YAML or JSON definition
        file: PathBuf,
    },

    /// Print the step tree of a definition
    Inspect {
        /// Path to YAML or JSON definition
        file: PathBuf,
    },

    /// Dry-run a definition against echo workers
    Run {
        /// Path to YAML or JSON definition
        file: PathBuf,

        /// Initial context data as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Engine configuration file (YAML or TOML)
        #[arg(short, long, env = "STEPFLOW_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Validate { file } => {
            let report = stepflow_cli::validate(&file)?;
            println!(
                "✓ {} is valid: {} top-level steps, {} steps total ({})",
                report.name,
                report.top_level_steps,
                report.total_steps,
                report.step_types.join(", ")
            );
        }
        Commands::Inspect { file } => {
            print!("{}", stepflow_cli::inspect(&file)?);
        }
        Commands::Run {
            file,
            input,
            config,
        } => {
            let report =
                stepflow_cli::run(&file, input.as_deref(), config.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.workflow.status == WorkflowStatus::Failed {
                anyhow::bail!(
                    "workflow failed: {}",
                    report.workflow.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }

    Ok(())
}
