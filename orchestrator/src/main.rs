//! Orchestrator CLI
//!
//! Offline tooling around the workflow engine: definition checks and
//! inspection of persisted executions.
//!
//! Usage:
//!   orchestrator validate workflows/release.toml
//!   orchestrator plan workflows/release.toml
//!   orchestrator executions list --user alice --status failed
//!   orchestrator executions show <execution-id>

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orchestrator::config::OrchestratorConfig;
use orchestrator::graph::{execution_levels, validate};
use orchestrator::workflow::WorkflowDefinition;

#[derive(Parser)]
#[command(name = "orchestrator")]
#[command(about = "DAG workflow and multi-agent collaboration engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the nearest .orchestrator.toml)
    #[arg(long, env = "ORCHESTRATOR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace). Default is warn.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a TOML workflow definition and report every problem
    Validate {
        /// Workflow definition file
        file: PathBuf,
    },
    /// Show the dependency levels a definition would run in
    Plan {
        /// Workflow definition file
        file: PathBuf,
    },
    /// Inspect persisted executions
    #[cfg(feature = "persistence")]
    Executions {
        #[command(subcommand)]
        command: ExecutionCommands,
    },
}

#[cfg(feature = "persistence")]
#[derive(Subcommand)]
enum ExecutionCommands {
    /// List executions, newest first
    List {
        /// Only executions submitted by this user
        #[arg(long)]
        user: Option<String>,

        /// Only executions in this status (pending, queued, running, ...)
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of rows
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one execution with its step states
    Show {
        /// Execution id
        id: String,
    },
}

/// Initialize tracing with the given verbosity level
///
/// - 0: warn (default)
/// - 1: info (-v)
/// - 2: debug (-vv)
/// - 3+: trace (-vvv)
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    // Allow RUST_LOG to override if set
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let config = match path {
        Some(path) => OrchestratorConfig::load_from_path(path)?,
        None => OrchestratorConfig::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate { file } => run_validate(&file, &config),
        Commands::Plan { file } => run_plan(&file, &config),
        #[cfg(feature = "persistence")]
        Commands::Executions { command } => run_executions_command(command, &config).await,
    }
}

fn load_definition(file: &Path) -> Result<WorkflowDefinition> {
    WorkflowDefinition::from_toml_file(file)
        .with_context(|| format!("Failed to load workflow definition {}", file.display()))
}

fn run_validate(file: &Path, config: &OrchestratorConfig) -> Result<()> {
    let definition = load_definition(file)?;
    let report = validate(&definition, config.engine.max_steps);

    if report.valid {
        println!(
            "Workflow '{}' is valid ({} steps)",
            definition.id,
            definition.steps.len()
        );
        return Ok(());
    }

    eprintln!("Workflow '{}' is invalid:\n", definition.id);
    for issue in &report.errors {
        match &issue.step_id {
            Some(step) => eprintln!("  [{}] {}", step, issue.message),
            None => eprintln!("  {}", issue.message),
        }
    }
    std::process::exit(1);
}

fn run_plan(file: &Path, config: &OrchestratorConfig) -> Result<()> {
    let definition = load_definition(file)?;
    validate(&definition, config.engine.max_steps).into_result()?;

    println!("Workflow: {}\n", definition.name);
    if !definition.description.is_empty() {
        println!("Description: {}\n", definition.description);
    }
    println!(
        "Levels (up to {} steps at once):",
        config.engine.max_parallel_steps
    );
    for (i, level) in execution_levels(&definition.steps).iter().enumerate() {
        println!("  {}. {}", i + 1, level.join(", "));
        for step_id in level {
            if let Some(step) = definition.step(step_id) {
                let source = match (&step.prompt_template_id, step.dependencies.is_empty()) {
                    (Some(template), _) => format!("template '{}'", template),
                    (None, true) => "inline prompt".to_string(),
                    (None, false) => format!("inline prompt, after {}", step.dependencies.join(", ")),
                };
                println!("     - {} [{}] {}", step.id, step.agent, source);
            }
        }
    }
    Ok(())
}

#[cfg(feature = "persistence")]
async fn run_executions_command(command: ExecutionCommands, config: &OrchestratorConfig) -> Result<()> {
    use orchestrator::db::SqliteExecutionStore;
    use orchestrator::store::ExecutionStore;
    use orchestrator::workflow::{ExecutionFilter, WorkflowStatus};

    let store = SqliteExecutionStore::open_at(config.persistence.resolve_db_path()?)?;

    match command {
        ExecutionCommands::List { user, status, limit } => {
            let status = status.map(|s| s.parse::<WorkflowStatus>()).transpose()?;
            let filter = ExecutionFilter {
                user_id: user,
                status,
                limit: Some(limit),
                ..Default::default()
            };
            let executions = store.list(&filter).await?;
            if executions.is_empty() {
                println!("No executions found.");
                return Ok(());
            }
            for state in executions {
                println!(
                    "{}  {:<10} {:>3}%  {}  ({}, {})",
                    state.id,
                    state.status,
                    state.progress,
                    state.workflow_id,
                    state.user_id,
                    state.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        ExecutionCommands::Show { id } => match store.get(&id).await? {
            Some(state) => {
                println!("Execution: {}", state.id);
                println!("Workflow: {} ({})", state.definition.name, state.workflow_id);
                println!("User: {}", state.user_id);
                println!("Status: {} ({}%)", state.status, state.progress);
                if let Some(error) = &state.error {
                    println!("Error: {}", error);
                }
                println!("Duration: {}ms", state.duration_ms());
                println!("\nSteps:");
                for step in &state.definition.steps {
                    let Some(step_state) = state.step(&step.id) else {
                        continue;
                    };
                    println!(
                        "  {} [{}] {:?} (attempts: {})",
                        step.id, step.agent, step_state.status, step_state.attempts
                    );
                    if let Some(error) = &step_state.error {
                        println!("     Error: {}", error);
                    }
                }
            }
            None => {
                eprintln!("Execution '{}' not found.", id);
                eprintln!("Use 'orchestrator executions list' to see stored executions.");
                std::process::exit(1);
            }
        },
    }

    Ok(())
}
