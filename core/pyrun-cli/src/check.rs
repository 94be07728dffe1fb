//! `pyrun check`: one-off or continuous type checking.

use pyrun_core::{
    shared_sink, Controller, FileStore, InterpreterBackend, JsonSelectionStore, LocalStore,
    PythonBackend, ReportSink, RunnerConfig, StorageConfig, TypeCheckError, TypeCheckReport,
    TypeCheckScheduler, TypeChecker, WatchPattern,
};
use std::path::Path;
use std::process::ExitCode;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use crate::terminal::{print_report, TerminalRenderer, TerminalSink};
use crate::CliError;

struct TerminalReports;

impl ReportSink for TerminalReports {
    fn report(&mut self, report: &TypeCheckReport) {
        print_report(report);
    }

    fn failed(&mut self, err: &TypeCheckError) {
        tracing::warn!(error = %err, "Type check iteration failed");
        eprintln!("pyrun: {}", err);
    }
}

pub fn run(project: &Path, watch: bool, interval_ms: Option<u64>) -> Result<ExitCode, CliError> {
    let storage = StorageConfig::from_home()?;
    let config = RunnerConfig::load(&storage)?;
    let backend: Arc<dyn InterpreterBackend> = Arc::new(PythonBackend::from_config(&config)?);
    let pattern = WatchPattern::new(&config.watch_pattern)?;

    if !watch {
        let store: Arc<dyn FileStore> = Arc::new(LocalStore::open(project)?);
        let mut checker = TypeChecker::new(backend, pattern);
        checker.set_project(Some(store));
        return match checker.tick()? {
            Some(report) => {
                print_report(&report);
                Ok(if report.is_clean() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                })
            }
            None => Ok(ExitCode::SUCCESS),
        };
    }

    let interval = interval_ms
        .map(|ms| Duration::from_millis(ms.max(1)))
        .unwrap_or_else(|| config.poll_interval());
    let (quit, quit_requested) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = quit.send(());
    })?;

    // The controller points the scheduler at the project and activates it.
    let mut checker = TypeChecker::new(Arc::clone(&backend), pattern);
    checker.set_active(false);
    let scheduler = TypeCheckScheduler::spawn(checker, interval, TerminalReports)?;

    let mut controller = Controller::new(
        backend,
        shared_sink(TerminalSink),
        Box::new(JsonSelectionStore::new(&storage)),
        TerminalRenderer::default(),
    );
    controller.select_project(project)?;
    controller.attach_scheduler(scheduler);
    controller.set_checking(true);

    if let Some(store) = controller.store() {
        eprintln!(
            "pyrun: watching {} every {}ms (Ctrl-C to stop)",
            store.root().display(),
            interval.as_millis()
        );
    }
    let _ = quit_requested.recv();
    controller.set_checking(false);
    if let Some(scheduler) = controller.detach_scheduler() {
        scheduler.shutdown();
    }
    Ok(ExitCode::SUCCESS)
}
