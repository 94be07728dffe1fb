//! `pyrun run` and `pyrun last`.

use pyrun_core::{
    shared_sink, Controller, JsonSelectionStore, PyrunError, PythonBackend, RunnerConfig,
    StorageConfig,
};
use std::env;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use crate::terminal::{TerminalRenderer, TerminalSink};
use crate::CliError;

/// Exit code for a run stopped with Ctrl-C, as a shell would report it.
const EXIT_INTERRUPTED: u8 = 130;

pub fn run(project: &Path, entry: &Path) -> Result<ExitCode, CliError> {
    let mut controller = build_controller()?;
    controller.select_project(project)?;
    let entry = if entry.is_absolute() {
        entry.to_path_buf()
    } else {
        env::current_dir()?.join(entry)
    };
    controller.select_entry(&entry)?;
    execute(&mut controller)
}

pub fn last() -> Result<ExitCode, CliError> {
    let mut controller = build_controller()?;
    controller.restore()?;
    if !controller.controls().run {
        eprintln!("pyrun: no saved entry point; use `pyrun run` first");
        return Ok(ExitCode::FAILURE);
    }
    execute(&mut controller)
}

fn build_controller() -> Result<Controller<TerminalRenderer>, CliError> {
    let storage = StorageConfig::from_home()?;
    let config = RunnerConfig::load(&storage)?;
    let backend = PythonBackend::from_config(&config)?;
    tracing::debug!(python = %backend.program().display(), "Using interpreter");
    Ok(Controller::new(
        Arc::new(backend),
        shared_sink(TerminalSink),
        Box::new(JsonSelectionStore::new(&storage)),
        TerminalRenderer::default(),
    )
    .with_requirements_file(config.requirements_file))
}

fn execute(controller: &mut Controller<TerminalRenderer>) -> Result<ExitCode, CliError> {
    let stop = controller.stop_handle();
    ctrlc::set_handler(move || {
        // Nothing running yet: behave like a plain Ctrl-C.
        if !stop.stop() {
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        }
    })?;

    match controller.run() {
        Ok(result) => {
            if let Some(ref value) = result.value {
                println!("{}", value);
            }
            if result.is_error() {
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Err(PyrunError::Session(err)) if err.is_interruption() => {
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        // The controller already wrote the failure to the output sink.
        Err(err) => {
            tracing::debug!(error = %err, "Run failed");
            Ok(ExitCode::FAILURE)
        }
    }
}
