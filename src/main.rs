use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use conductor::config::{Config, RunDefinition};
use conductor::orchestration::ExecutionEngine;
use conductor::state::RunRecordStore;
use conductor::workflow::{RunId, RunStatus};
use conductor::{Error, Result};

/// Conductor - stage-pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1   Enable debug logging (alternative to --debug)\n    RUST_LOG            Override the log filter"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.conductor/conductor.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Print the required stages and batch order of a run without executing it
    Plan {
        /// Run definition (TOML)
        run: PathBuf,
    },

    /// Execute a run and print its report as JSON
    Run {
        /// Run definition (TOML)
        run: PathBuf,

        /// Directory for the run record (overrides config)
        #[arg(long)]
        record_dir: Option<PathBuf>,

        /// Echo inputs instead of invoking stage commands
        #[arg(long)]
        dry_run: bool,
    },

    /// Print a stored run record
    Show {
        /// Run ID
        run_id: String,

        /// Directory holding run records (overrides config)
        #[arg(long)]
        record_dir: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    conductor::log::init(cli.debug);

    match run_cli(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_cli(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Plan { run } => run_plan(&config, &run),
        Command::Run {
            run,
            record_dir,
            dry_run,
        } => run_execute(&config, &run, record_dir, dry_run),
        Command::Show { run_id, record_dir } => run_show(&config, &run_id, record_dir),
    }
}

fn record_store(config: &Config, dir: Option<PathBuf>) -> Result<RunRecordStore> {
    let dir = match dir {
        Some(dir) => dir,
        None => config.record_dir()?,
    };
    Ok(RunRecordStore::new(dir))
}

/// Build the engine for `definition`.
fn build_engine(
    config: &Config,
    definition: &RunDefinition,
    dry_run: bool,
) -> Result<ExecutionEngine> {
    Ok(ExecutionEngine::new(definition.build_registry(dry_run)?)
        .with_classifier(definition.build_classifier()?)
        .with_config(config.engine_config()))
}

fn run_plan(config: &Config, path: &Path) -> Result<ExitCode> {
    let definition = RunDefinition::load(path)?;
    let graph = definition.build_graph(config)?;
    let engine = build_engine(config, &definition, true)?;
    let plan = engine.plan(&graph, &definition.run_input())?;

    let pruned: Vec<serde_json::Value> = plan
        .pruned
        .iter()
        .map(|p| serde_json::json!({ "task": p.task, "dependency": p.dependency }))
        .collect();
    let output = serde_json::json!({
        "required_stages": plan.required.as_slice(),
        "batches": plan.order.batch_names(),
        "pruned_dependencies": pruned,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(ExitCode::SUCCESS)
}

fn run_execute(
    config: &Config,
    path: &Path,
    record_dir: Option<PathBuf>,
    dry_run: bool,
) -> Result<ExitCode> {
    let definition = RunDefinition::load(path)?;
    let graph = definition.build_graph(config)?;
    let engine = build_engine(config, &definition, dry_run)?
        .with_record_store(record_store(config, record_dir)?);
    let token = engine.cancellation_token();

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, aborting run");
                token.cancel();
            }
        });
        let report = engine.execute(&graph, definition.run_input()).await;
        watcher.abort();
        report
    })?;

    info!(run_id = %report.run_id, status = %report.status, "Run finished");
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(exit_code(report.status))
}

fn run_show(config: &Config, run_id: &str, record_dir: Option<PathBuf>) -> Result<ExitCode> {
    let run_id: RunId = run_id
        .parse()
        .map_err(|e| Error::Validation(format!("invalid run id {:?}: {}", run_id, e)))?;
    let store = record_store(config, record_dir)?;

    let rt = tokio::runtime::Runtime::new()?;
    let record = rt.block_on(store.load(&run_id))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(ExitCode::SUCCESS)
}

fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Cancelled => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    }
}
