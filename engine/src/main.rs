//! Book-writing workflow engine CLI.
//!
//! Runs live under `<store>/runs/`, projects under `<store>/projects/`. A run
//! is submitted (queued), then executed once against its project.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};

use engine::core::types::{Project, RunStatus};
use engine::exit_codes;
use engine::io::command_provider::CommandProvider;
use engine::io::config::{EngineConfig, load_config, write_config};
use engine::io::store::{BookStore, FileStore, RunStore};
use engine::run::{execute_run, submit};

#[derive(Parser)]
#[command(
    name = "engine",
    version,
    about = "Book-writing workflow engine: outline, chapter, export, and profile runs"
)]
struct Cli {
    /// Store root holding projects, runs, and config.toml.
    #[arg(long, global = true, default_value = ".")]
    store: PathBuf,
    /// Config file (defaults to `<store>/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `config.toml` if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Create an empty project.
    CreateProject {
        #[arg(long)]
        id: String,
        #[arg(long)]
        title: String,
    },
    /// Queue a run and print its id.
    Submit {
        #[arg(long)]
        project: String,
        /// toc | refine_toc | chapter | export | profile_assistant
        #[arg(long)]
        mode: String,
        /// Run input as a JSON object.
        #[arg(long)]
        input: Option<String>,
    },
    /// Execute a queued run and print the final record.
    Execute { run_id: String },
    /// Submit and execute in one step, printing the run output.
    Run {
        #[arg(long)]
        project: String,
        #[arg(long)]
        mode: String,
        #[arg(long)]
        input: Option<String>,
    },
    /// Print a run record.
    Status { run_id: String },
}

fn main() {
    engine::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let store = FileStore::new(&cli.store);
    let config_path = cli.config.clone().unwrap_or_else(|| store.config_path());
    match cli.command {
        Command::Init { force } => {
            if force || !config_path.exists() {
                write_config(&config_path, &EngineConfig::default())?;
            }
            println!("{}", config_path.display());
            Ok(exit_codes::OK)
        }
        Command::CreateProject { id, title } => {
            if store.load_project(&id).is_ok() {
                bail!("project '{id}' already exists");
            }
            let project = Project::new(id, title);
            store.save_project(&project)?;
            print_json(&project)?;
            Ok(exit_codes::OK)
        }
        Command::Submit {
            project,
            mode,
            input,
        } => {
            let run = submit(&store, &project, &mode, parse_input(input.as_deref())?)?;
            println!("{}", run.id);
            Ok(exit_codes::OK)
        }
        Command::Execute { run_id } => {
            let config = load_config(&config_path)?;
            let record = execute(&store, &config, &run_id)?;
            print_json(&record)?;
            Ok(status_code(record.status))
        }
        Command::Run {
            project,
            mode,
            input,
        } => {
            let config = load_config(&config_path)?;
            let queued = submit(&store, &project, &mode, parse_input(input.as_deref())?)?;
            let record = execute(&store, &config, &queued.id)?;
            match record.status {
                RunStatus::Completed => print_json(&record.output)?,
                _ => print_json(&record)?,
            }
            Ok(status_code(record.status))
        }
        Command::Status { run_id } => {
            let record = store
                .load_run(&run_id)?
                .with_context(|| format!("run not found: {run_id}"))?;
            print_json(&record)?;
            Ok(exit_codes::OK)
        }
    }
}

/// Execute `run_id`; a run that failed is reported through its record
/// rather than as a CLI error.
fn execute(
    store: &FileStore,
    config: &EngineConfig,
    run_id: &str,
) -> Result<engine::core::types::RunRecord> {
    let provider = CommandProvider::new(config.provider.clone());
    match execute_run(store, &provider, config, run_id) {
        Ok(record) => Ok(record),
        Err(err) => match store.load_run(run_id)? {
            Some(record) if record.status == RunStatus::Failed => {
                eprintln!("{:#}", err);
                Ok(record)
            }
            _ => Err(err),
        },
    }
}

fn status_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Failed => exit_codes::RUN_FAILED,
        _ => exit_codes::OK,
    }
}

fn parse_input(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("parse --input json")? {
        Value::Object(map) => Ok(map),
        _ => bail!("--input must be a JSON object"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
