//! The execution thread behind a session.
//!
//! One thread per session owns the interpreter and the scratch directory the
//! project is mounted into. It serves [`Request`]s strictly one at a time and
//! answers each with output events followed by exactly one terminal event.
//! The only state it shares with the controller is the interrupt byte.

use fs_err as fs;
use pyrun_protocol::{codes, CorrelationId, Event, Request};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tempfile::TempDir;
use ulid::Ulid;

use crate::error::InterpreterError;
use crate::interpreter::{ExecRequest, Interpreter, InterpreterBackend, OutputChunk, Outcome, Stream};
use crate::interrupt::InterruptFlag;
use crate::requirements::parse_manifest;
use crate::store::FileStore;

/// Mount point of the project inside the session scratch directory.
pub const MOUNT_DIR: &str = "project";

pub(crate) struct WorkerHandle {
    pub requests: Sender<Request>,
    pub events: Receiver<Event>,
    pub thread: JoinHandle<()>,
}

pub(crate) struct WorkerOptions {
    pub session_id: Ulid,
    pub backend: Arc<dyn InterpreterBackend>,
    pub store: Arc<dyn FileStore>,
    pub interrupt: InterruptFlag,
    pub requirements_file: String,
}

pub(crate) fn spawn(options: WorkerOptions) -> std::io::Result<WorkerHandle> {
    let (request_tx, request_rx) = mpsc::channel::<Request>();
    let (event_tx, event_rx) = mpsc::channel::<Event>();
    let name = format!("pyrun-session-{}", options.session_id);
    let worker = Worker {
        session_id: options.session_id,
        backend: options.backend,
        store: options.store,
        interrupt: options.interrupt,
        requirements_file: options.requirements_file,
        interpreter: None,
        scratch: None,
        events: event_tx,
    };
    let thread = thread::Builder::new()
        .name(name)
        .spawn(move || worker.serve(request_rx))?;
    Ok(WorkerHandle {
        requests: request_tx,
        events: event_rx,
        thread,
    })
}

struct Worker {
    session_id: Ulid,
    backend: Arc<dyn InterpreterBackend>,
    store: Arc<dyn FileStore>,
    interrupt: InterruptFlag,
    requirements_file: String,
    interpreter: Option<Box<dyn Interpreter>>,
    scratch: Option<TempDir>,
    events: Sender<Event>,
}

impl Worker {
    fn serve(mut self, requests: Receiver<Request>) {
        for request in requests {
            tracing::debug!(
                session = %self.session_id,
                id = request.id(),
                kind = ?request.kind(),
                "Worker received request"
            );
            let terminal = match request {
                Request::Init { id } => self.init(id),
                Request::Run {
                    id,
                    script,
                    filename,
                } => self.run(id, &script, filename.as_deref()),
            };
            if self.events.send(terminal).is_err() {
                break;
            }
        }
        tracing::debug!(session = %self.session_id, "Worker exiting");
    }

    fn init(&mut self, id: CorrelationId) -> Event {
        if self.interpreter.is_some() {
            return Event::finished(id);
        }
        let scratch = match tempfile::Builder::new().prefix("pyrun-session-").tempdir() {
            Ok(scratch) => scratch,
            Err(err) => {
                return Event::error(
                    id,
                    codes::LAUNCH_FAILED,
                    format!("Failed to create session directory: {}", err),
                )
            }
        };
        match self.backend.launch() {
            Ok(interpreter) => {
                tracing::info!(
                    session = %self.session_id,
                    backend = self.backend.name(),
                    scratch = %scratch.path().display(),
                    "Interpreter launched"
                );
                self.interpreter = Some(interpreter);
                self.scratch = Some(scratch);
                Event::finished(id)
            }
            Err(err) => Event::error(id, codes::LAUNCH_FAILED, err.to_string()),
        }
    }

    fn run(&mut self, id: CorrelationId, script: &str, filename: Option<&str>) -> Event {
        let (Some(interpreter), Some(scratch)) = (self.interpreter.as_mut(), self.scratch.as_ref())
        else {
            return Event::error(id, codes::NOT_INITIALIZED, "Session has not been initialized");
        };

        let mount_point = scratch.path().join(MOUNT_DIR);
        let mut view = match self.store.mount(&mount_point) {
            Ok(view) => view,
            Err(err) => return Event::error(id, codes::MOUNT_FAILED, err.to_string()),
        };

        let events = self.events.clone();
        let mut emit = move |chunk: OutputChunk| {
            let event = match chunk.stream {
                Stream::Stdout => Event::Stdout { stdout: chunk.text },
                Stream::Stderr => Event::Stderr { stderr: chunk.text },
            };
            let _ = events.send(event);
        };

        let step = run_mounted(
            interpreter.as_mut(),
            &self.interrupt,
            &self.requirements_file,
            view.path(),
            script,
            filename,
            &mut emit,
        );

        // Sync and unmount happen on every exit path, including faults.
        match view.sync() {
            Ok(report) if !report.is_empty() => tracing::debug!(
                session = %self.session_id,
                written = report.written.len(),
                removed = report.removed.len(),
                conflicts = report.conflicts.len(),
                "Project synced"
            ),
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(session = %self.session_id, error = %err, "Project sync failed");
                emit(OutputChunk::stderr(format!("Failed to sync project: {}", err)));
            }
        }
        if let Err(err) = view.unmount() {
            tracing::warn!(session = %self.session_id, error = %err, "Project unmount failed");
        }

        match step {
            Ok(Outcome::Completed { value }) => Event::Finished {
                id,
                result: value,
                error: None,
            },
            Ok(Outcome::Raised { traceback }) => Event::Finished {
                id,
                result: None,
                error: Some(traceback),
            },
            // A script raising KeyboardInterrupt itself is an ordinary
            // uncaught exception; only a requested stop is a cancellation.
            Ok(Outcome::Interrupted { traceback }) if !self.interrupt.is_requested() => {
                Event::Finished {
                    id,
                    result: None,
                    error: Some(traceback),
                }
            }
            Ok(Outcome::Interrupted { traceback }) => {
                Event::error(id, codes::INTERRUPTED, traceback)
            }
            Err(err) => {
                let event = interpreter_error_event(id, &err);
                if !matches!(err, InterpreterError::Interrupted { .. }) {
                    tracing::warn!(session = %self.session_id, error = %err, "Interpreter lost");
                    self.interpreter = None;
                }
                event
            }
        }
    }
}

fn run_mounted(
    interpreter: &mut dyn Interpreter,
    interrupt: &InterruptFlag,
    requirements_file: &str,
    mount: &Path,
    script: &str,
    filename: Option<&str>,
    emit: &mut dyn FnMut(OutputChunk),
) -> Result<Outcome, InterpreterError> {
    let requirements = read_requirements(&mount.join(requirements_file));
    if !requirements.is_empty() {
        let report = interpreter.install(&requirements, interrupt, emit)?;
        if !report.failed.is_empty() {
            tracing::warn!(failed = ?report.failed, "Some requirements failed to install");
        }
        tracing::debug!(installed = report.installed.len(), "Requirements installed");
    }

    let evicted = interpreter.evict_modules(mount)?;
    if evicted > 0 {
        tracing::debug!(evicted, "Evicted project modules");
    }

    interpreter.execute(
        ExecRequest {
            source: script,
            filename,
            cwd: mount,
        },
        interrupt,
        emit,
    )
}

fn read_requirements(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(content) => parse_manifest(&content),
        Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
        Err(err) => {
            tracing::warn!(error = %err, "Could not read requirements; installing nothing");
            Vec::new()
        }
    }
}

fn interpreter_error_event(id: CorrelationId, err: &InterpreterError) -> Event {
    let code = match err {
        InterpreterError::Interrupted { .. } => codes::INTERRUPTED,
        InterpreterError::Launch(_) => codes::LAUNCH_FAILED,
        InterpreterError::Malformed(_) => codes::MALFORMED_MESSAGE,
        InterpreterError::Exited { .. } | InterpreterError::Io(_) => codes::INTERPRETER_EXITED,
    };
    Event::error(id, code, err.to_string())
}
