//! cellrun CLI - run code in an isolated, interruptible execution unit.

mod check;
mod colors;
mod run;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use cellrun_core::{HostConfig, ProcessSpawner, ScriptInterpreter, ThreadSpawner, UnitSpawner};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "cellrun")]
#[command(about = "Run code in an isolated, interruptible execution unit")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Where the execution unit runs
    #[arg(long, global = true, value_enum, default_value_t = WorkerKind::Process)]
    worker: WorkerKind,

    /// Path to the cellrun-worker binary (process units only)
    #[arg(long, global = true)]
    worker_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum WorkerKind {
    /// Separate worker process, interrupted by message
    Process,
    /// Thread inside the CLI, interrupted through shared memory
    Thread,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file
    Run {
        /// Path to the script
        file: PathBuf,
    },

    /// Run code given on the command line
    Exec {
        /// Source code to run
        code: String,
    },

    /// Show the effective configuration and start a unit once
    Check {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

/// How to create execution units.
pub struct UnitOptions {
    kind: WorkerKind,
    worker_path: Option<PathBuf>,
}

impl UnitOptions {
    pub fn spawner(&self) -> anyhow::Result<Arc<dyn UnitSpawner>> {
        let spawner: Arc<dyn UnitSpawner> = match self.kind {
            WorkerKind::Thread => Arc::new(ThreadSpawner::new(ScriptInterpreter::new)),
            WorkerKind::Process => match &self.worker_path {
                Some(path) => Arc::new(ProcessSpawner::new(path)),
                None => Arc::new(ProcessSpawner::worker()?),
            },
        };
        Ok(spawner)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Helper to format cellrun-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<cellrun_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    let config = HostConfig::load(cli.config.as_deref()).map_err(|e| format_error(e.into()))?;
    let unit = UnitOptions {
        kind: cli.worker,
        worker_path: cli.worker_path,
    };

    let code = match cli.command {
        Commands::Run { file } => run::execute_file(&file, &config, &unit)
            .await
            .map_err(format_error)?,

        Commands::Exec { code } => run::execute(&code, "<exec>", &config, &unit)
            .await
            .map_err(format_error)?,

        Commands::Check { json } => {
            check::execute(&config, &unit, json).await.map_err(format_error)?;
            ExitCode::SUCCESS
        }
    };

    Ok(code)
}
