//! pyrun: run Python projects in an isolated interpreter.
//!
//! ## Subcommands
//!
//! - `run`: Run an entry point of a project, streaming its output
//! - `last`: Re-run the last selected project and entry point
//! - `check`: Type-check a project once, or keep checking with `--watch`
//! - `fingerprint`: Print the content fingerprint of a project's sources

mod check;
mod fingerprint;
mod logging;
mod run;
mod terminal;

use clap::{Parser, Subcommand};
use pyrun_core::{ConfigError, PyrunError, StoreError, TypeCheckError};
use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;

#[derive(Parser)]
#[command(name = "pyrun")]
#[command(about = "Run Python projects in an isolated interpreter")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an entry point (Ctrl-C stops the script)
    Run {
        /// Project directory
        #[arg(long, short)]
        project: PathBuf,

        /// Entry point file, inside the project directory
        #[arg(value_name = "ENTRY")]
        entry: PathBuf,
    },

    /// Re-run the last selected entry point
    Last,

    /// Type-check a project with mypy
    Check {
        /// Project directory
        #[arg(long, short)]
        project: PathBuf,

        /// Keep checking whenever the sources change
        #[arg(long)]
        watch: bool,

        /// Poll interval in milliseconds (defaults to the configured interval)
        #[arg(long, value_name = "MS")]
        interval_ms: Option<u64>,
    },

    /// Print the content fingerprint of a project's sources
    Fingerprint {
        /// Project directory
        #[arg(long, short)]
        project: PathBuf,
    },
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Pyrun(#[from] PyrunError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    TypeCheck(#[from] TypeCheckError),

    #[error("Failed to install Ctrl-C handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { project, entry } => run::run(&project, &entry),
        Commands::Last => run::last(),
        Commands::Check {
            project,
            watch,
            interval_ms,
        } => check::run(&project, watch, interval_ms),
        Commands::Fingerprint { project } => fingerprint::run(&project),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            tracing::debug!(error = ?err, "pyrun failed");
            eprintln!("pyrun: {}", err);
            ExitCode::FAILURE
        }
    }
}
