//! Background type checking.
//!
//! [`TypeChecker`] is the synchronous core: each [`TypeChecker::tick`] asks
//! the change-detection cache whether the watched sources changed and, only
//! then, runs mypy through its own execution session. [`TypeCheckScheduler`]
//! drives ticks from a dedicated thread at a fixed interval and can be paused,
//! re-pointed at another project, and shut down.

use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{SessionError, TypeCheckError};
use crate::fingerprint::{ChangeDetectionCache, ChangeOutcome};
use crate::interpreter::InterpreterBackend;
use crate::interrupt::StopHandle;
use crate::session::{ExecutionSession, NullSink};
use crate::store::{FileStore, WatchPattern};

pub const NO_SOURCES_INFO: &str = "No Python source files.";
pub const NO_DIRECTORY_INFO: &str = "No directory selected";

pub const CHECK_FILENAME: &str = "<typecheck>";

/// Installs the checker's own dependencies when missing, checks the mounted
/// project and evaluates to mypy's `(stdout, stderr, status)` as JSON.
pub const CHECK_SCRIPT: &str = r#"import importlib
import importlib.util
import json
import os
import subprocess
import sys

for _requirement in ("mypy", "typing_extensions", "mypy_extensions"):
    if importlib.util.find_spec(_requirement) is None:
        subprocess.run(
            [sys.executable, "-m", "pip", "install", "--quiet", _requirement],
            stdin=subprocess.DEVNULL,
            check=False,
        )
importlib.invalidate_caches()

from mypy import api

json.dumps(api.run([".", "--cache-dir", os.devnull]))
"#;

// ═══════════════════════════════════════════════════════════════════════════════
// Report
// ═══════════════════════════════════════════════════════════════════════════════

/// `(error text, info text, status)`. Status 0 means a clean check, and then
/// the error text is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCheckReport {
    pub error_text: String,
    pub info_text: String,
    pub status: i32,
}

impl TypeCheckReport {
    pub fn no_sources() -> Self {
        Self {
            error_text: String::new(),
            info_text: NO_SOURCES_INFO.to_string(),
            status: 1,
        }
    }

    pub fn no_directory() -> Self {
        Self {
            error_text: String::new(),
            info_text: NO_DIRECTORY_INFO.to_string(),
            status: 1,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.status == 0
    }

    /// Normalises raw checker output. On a clean check the summary line mypy
    /// prints on stdout is informational, not an error.
    pub fn from_checker_output(stdout: &str, stderr: &str, status: i32) -> Self {
        let report = normalize(stdout);
        let info = normalize(stderr);
        if status == 0 {
            let info_text = [report, info]
                .into_iter()
                .filter(|text| !text.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            Self {
                error_text: String::new(),
                info_text,
                status,
            }
        } else {
            Self {
                error_text: report,
                info_text: info,
                status,
            }
        }
    }
}

fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n").trim_end().to_string()
}

/// Parses the value the check script evaluated to.
pub fn parse_check_result(value: Option<&str>) -> Result<TypeCheckReport, TypeCheckError> {
    let value = value.ok_or(TypeCheckError::MissingResult)?;
    let (stdout, stderr, status): (String, String, i32) =
        serde_json::from_str(value).map_err(|err| TypeCheckError::Parse(err.to_string()))?;
    Ok(TypeCheckReport::from_checker_output(&stdout, &stderr, status))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Checker
// ═══════════════════════════════════════════════════════════════════════════════

pub struct TypeChecker {
    backend: Arc<dyn InterpreterBackend>,
    store: Option<Arc<dyn FileStore>>,
    cache: ChangeDetectionCache,
    session: Option<ExecutionSession>,
    active: bool,
    running: Arc<Mutex<Option<StopHandle>>>,
}

impl std::fmt::Debug for TypeChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeChecker")
            .field("backend", &self.backend.name())
            .field("root", &self.store.as_ref().map(|store| store.root().to_path_buf()))
            .field("active", &self.active)
            .field("session", &self.session.as_ref().map(|session| session.state()))
            .finish()
    }
}

impl TypeChecker {
    pub fn new(backend: Arc<dyn InterpreterBackend>, pattern: WatchPattern) -> Self {
        Self {
            backend,
            store: None,
            cache: ChangeDetectionCache::new(pattern),
            session: None,
            active: true,
            running: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Inactive checkers keep their stored fingerprint, so re-activating only
    /// reports if the tree differs from what was last seen.
    pub fn set_active(&mut self, active: bool) {
        if self.active != active {
            tracing::info!(active, "Type checking toggled");
        }
        self.active = active;
    }

    /// Points the checker at another project (or none). The check session
    /// belongs to the old project and is discarded.
    pub fn set_project(&mut self, store: Option<Arc<dyn FileStore>>) {
        self.session = None;
        self.cache.forget();
        self.store = store;
    }

    pub fn project(&self) -> Option<&Arc<dyn FileStore>> {
        self.store.as_ref()
    }

    /// Stops a check in progress from another thread.
    pub fn stop_slot(&self) -> Arc<Mutex<Option<StopHandle>>> {
        Arc::clone(&self.running)
    }

    /// One scheduler iteration. `Ok(None)` means there was nothing to report.
    pub fn tick(&mut self) -> Result<Option<TypeCheckReport>, TypeCheckError> {
        if !self.active {
            return Ok(None);
        }
        let store = self.store.clone();
        match self.cache.poll(store.as_deref())? {
            ChangeOutcome::Unchanged => Ok(None),
            ChangeOutcome::NoDirectory => Ok(Some(TypeCheckReport::no_directory())),
            ChangeOutcome::NoSources => Ok(Some(TypeCheckReport::no_sources())),
            ChangeOutcome::Changed(fingerprint) => {
                let Some(store) = store else {
                    return Ok(Some(TypeCheckReport::no_directory()));
                };
                tracing::info!(%fingerprint, root = %store.root().display(), "Type checking project");
                self.check(store).map(Some)
            }
        }
    }

    fn check(&mut self, store: Arc<dyn FileStore>) -> Result<TypeCheckReport, TypeCheckError> {
        let started = Instant::now();
        let running = Arc::clone(&self.running);
        let session = self.ready_session(store)?;
        if let Ok(mut slot) = running.lock() {
            *slot = Some(session.stop_handle());
        }
        let outcome = session.run(CHECK_SCRIPT, Some(CHECK_FILENAME));
        if let Ok(mut slot) = running.lock() {
            *slot = None;
        }

        let result = outcome?;
        if let Some(error) = result.error {
            return Err(TypeCheckError::CheckFailed(error));
        }
        let report = parse_check_result(result.value.as_deref())?;
        tracing::info!(
            status = report.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Type check finished"
        );
        Ok(report)
    }

    /// The check session, rebuilt when missing or faulted.
    fn ready_session(
        &mut self,
        store: Arc<dyn FileStore>,
    ) -> Result<&mut ExecutionSession, SessionError> {
        let reusable = self
            .session
            .as_ref()
            .is_some_and(|session| !session.is_faulted());
        if !reusable {
            if let Some(old) = self.session.take() {
                tracing::info!(session = %old.id(), "Replacing faulted type-check session");
            }
            let mut session =
                ExecutionSession::new(Arc::clone(&self.backend), store, Box::new(NullSink));
            session.init()?;
            self.session = Some(session);
        }
        self.session
            .as_mut()
            .ok_or_else(|| SessionError::Transport("type-check session unavailable".to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Receives scheduler output on the scheduler thread.
pub trait ReportSink: Send {
    fn report(&mut self, report: &TypeCheckReport);

    fn failed(&mut self, err: &TypeCheckError) {
        tracing::warn!(error = %err, "Type check iteration failed");
    }
}

impl<F> ReportSink for F
where
    F: FnMut(&TypeCheckReport) + Send,
{
    fn report(&mut self, report: &TypeCheckReport) {
        self(report)
    }
}

enum Control {
    SetActive(bool),
    SetProject(Option<Arc<dyn FileStore>>),
    Shutdown,
}

pub struct TypeCheckScheduler;

impl TypeCheckScheduler {
    pub fn spawn<S>(
        checker: TypeChecker,
        interval: Duration,
        sink: S,
    ) -> std::io::Result<SchedulerHandle>
    where
        S: ReportSink + 'static,
    {
        let (control, commands) = mpsc::channel();
        let running = checker.stop_slot();
        let thread = thread::Builder::new()
            .name("pyrun-typecheck".to_string())
            .spawn(move || run_loop(checker, interval, commands, sink))?;
        Ok(SchedulerHandle {
            control,
            running,
            thread: Some(thread),
        })
    }
}

fn run_loop<S: ReportSink>(
    mut checker: TypeChecker,
    interval: Duration,
    commands: Receiver<Control>,
    mut sink: S,
) -> TypeChecker {
    tracing::debug!(interval_ms = interval.as_millis() as u64, "Type-check scheduler started");
    loop {
        match checker.tick() {
            Ok(Some(report)) => sink.report(&report),
            Ok(None) => {}
            Err(err) => sink.failed(&err),
        }

        // Sleep until the next poll, applying control messages as they come.
        let deadline = Instant::now() + interval;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match commands.recv_timeout(remaining) {
                Ok(Control::SetActive(active)) => checker.set_active(active),
                Ok(Control::SetProject(store)) => checker.set_project(store),
                Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!("Type-check scheduler stopped");
                    return checker;
                }
                Err(RecvTimeoutError::Timeout) => break,
            }
        }
    }
}

pub struct SchedulerHandle {
    control: Sender<Control>,
    running: Arc<Mutex<Option<StopHandle>>>,
    thread: Option<JoinHandle<TypeChecker>>,
}

impl SchedulerHandle {
    pub fn set_active(&self, active: bool) {
        let _ = self.control.send(Control::SetActive(active));
    }

    pub fn set_project(&self, store: Option<Arc<dyn FileStore>>) {
        let _ = self.control.send(Control::SetProject(store));
    }

    /// Cancels the loop, interrupting a check in progress, and waits for the
    /// thread to exit. Returns the checker for inspection or reuse.
    pub fn shutdown(mut self) -> Option<TypeChecker> {
        self.cancel();
        self.thread.take().and_then(|thread| thread.join().ok())
    }

    fn cancel(&self) {
        let _ = self.control.send(Control::Shutdown);
        if let Ok(slot) = self.running.lock() {
            if let Some(stop) = slot.as_ref() {
                stop.stop();
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.cancel();
            let _ = thread.join();
        }
    }
}
