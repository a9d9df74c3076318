//! `flowgraph` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: check a workflow definition and print its levels.
//! - `run`:      execute a workflow locally or in worker processes.
//! - `machine`:  drive a state machine through a list of events.
//! - `render`:   print the Airflow DAG file for a workflow.
//! - `delegate`: run a workflow on Airflow.
//! - `worker`:   serve one process-backend request on stdin/stdout.

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use engine::{
    ExecutionResult, Executor, GuardsRegistry, LocalExecutor, MachineError, ProcessExecutor,
    RunError, SchemaGuard, StateMachineDefinition, StateMachineRunner, WorkerCommand, Workflow,
    WorkflowDefinition,
};
use remote::{AirflowClient, DelegatedExecutor};
use serde::Serialize;
use tools::ToolRegistry;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;

#[derive(Parser)]
#[command(name = "flowgraph", about = "Workflow graph engine", version)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "FLOWGRAPH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Local,
    Process,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Execute a workflow with the built-in actions.
    Run {
        path: PathBuf,
        #[arg(long, value_enum, default_value = "local")]
        backend: Backend,
        #[arg(long, env = "FLOWGRAPH_MAX_WORKERS")]
        max_workers: Option<usize>,
    },
    /// Run a state machine definition against a sequence of events.
    Machine {
        path: PathBuf,
        /// Event to deliver; repeat for a sequence.
        #[arg(long = "event")]
        events: Vec<String>,
        /// Start here instead of the machine's start state.
        #[arg(long)]
        start: Option<String>,
    },
    /// Print the Airflow DAG file generated for a workflow.
    Render {
        path: PathBuf,
        /// Write to this file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run a workflow on Airflow and wait for it to finish.
    Delegate {
        path: PathBuf,
        /// JSON object passed as the DAG run's `conf`.
        #[arg(long)]
        conf: Option<String>,
    },
    /// Serve a single process-backend request (stdin → stdout).
    Worker,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // stdout carries command output and the worker protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    let tools = tools::builtin::registry();

    match cli.command {
        Command::Validate { path } => {
            let workflow = load_workflow(&path)?;
            println!(
                "workflow '{}' (version {}) is valid: {} step(s)",
                workflow.id(),
                workflow.version(),
                workflow.len()
            );
            for (n, level) in engine::dag::levels(&workflow).iter().enumerate() {
                println!("  level {n}: {}", level.join(", "));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            path,
            backend,
            max_workers,
        } => {
            let workflow = load_workflow(&path)?;
            let mut config = settings.executor();
            if let Some(n) = max_workers {
                config.max_workers = n.max(1);
            }

            let executor: Box<dyn Executor> = match backend {
                Backend::Local => Box::new(LocalExecutor::new(config)),
                Backend::Process => {
                    let command = WorkerCommand::current_exe()
                        .context("cannot locate the flowgraph binary for worker processes")?;
                    Box::new(ProcessExecutor::new(config, command))
                }
            };

            let guards = schema_guards(&tools);
            report_run(executor.run(&workflow, &tools, &guards).await)
        }
        Command::Machine {
            path,
            events,
            start,
        } => {
            let text = read(&path)?;
            let machine = StateMachineDefinition::from_json(&text)
                .and_then(StateMachineDefinition::build)
                .with_context(|| format!("invalid state machine {}", path.display()))?;

            let guards = schema_guards(&tools);
            let runner = StateMachineRunner::new();
            let outcome = match &start {
                Some(start) => runner.run_from(&machine, start, events, &tools, &guards).await,
                None => runner.run(&machine, events, &tools, &guards).await,
            };

            match outcome {
                Ok(run) => {
                    print_json(&run)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(MachineError::StateFailed {
                    state_id,
                    cause,
                    run,
                }) => {
                    print_json(&run)?;
                    eprintln!("state '{state_id}' failed: {cause}");
                    Ok(ExitCode::FAILURE)
                }
                Err(err) => Err(err.into()),
            }
        }
        Command::Render { path, out } => {
            let workflow = load_workflow(&path)?;
            let artifact = remote::airflow::generate(&workflow, &tools)?;
            match out {
                Some(out) => {
                    std::fs::write(&out, &artifact.source)
                        .with_context(|| format!("cannot write {}", out.display()))?;
                    info!(path = %out.display(), dag_id = %artifact.dag_id, "DAG file written");
                }
                None => print!("{}", artifact.source),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Delegate { path, conf } => {
            let workflow = load_workflow(&path)?;
            let mut config = settings.delegated();
            config.run_conf = conf
                .map(|c| serde_json::from_str::<serde_json::Value>(&c))
                .transpose()
                .context("--conf is not valid JSON")?;

            let client = AirflowClient::new(settings.airflow.clone())?;
            let executor = DelegatedExecutor::new(client, config);
            report_run(executor.run(&workflow, &tools, &GuardsRegistry::new()).await)
        }
        Command::Worker => {
            engine::worker::serve(&tools, tokio::io::stdin(), tokio::io::stdout())
                .await
                .context("worker I/O failed")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))
}

fn load_workflow(path: &Path) -> Result<Workflow> {
    let text = read(path)?;
    WorkflowDefinition::from_json(&text)
        .and_then(WorkflowDefinition::build)
        .with_context(|| format!("invalid workflow {}", path.display()))
}

fn schema_guards(tools: &ToolRegistry) -> GuardsRegistry {
    let mut guards = GuardsRegistry::new();
    guards.add_global_pre(SchemaGuard::from_registry(tools));
    guards
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print the (possibly partial) result; step failures exit non-zero.
fn report_run(outcome: Result<ExecutionResult, RunError>) -> Result<ExitCode> {
    match outcome {
        Ok(result) => {
            print_json(&result)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(RunError::StepsFailed(failure)) => {
            print_json(&failure.result)?;
            eprintln!("{failure}");
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err.into()),
    }
}
