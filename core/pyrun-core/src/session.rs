//! Execution sessions: the controller side of the session protocol.
//!
//! An [`ExecutionSession`] owns one execution thread and talks to it only
//! through ordered messages plus the shared interrupt byte. Calls are tracked
//! in a [`PendingCalls`] table and resolved by a single dispatch loop that
//! matches terminal events to their correlation id.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ─init─▶ Initializing ─▶ Ready ⇄ Running ─▶ Faulted
//! ```
//!
//! `Faulted` is terminal. A session that was stopped during a run always ends
//! up `Faulted`, even when the run itself finished cleanly, because the
//! interpreter's module cache and mount are not trusted after a forced abort.
//! Recovery means constructing a new session.

use pyrun_protocol::{codes, CorrelationId, ErrorInfo, Event, Request, RequestKind};
use std::sync::{Arc, Mutex, PoisonError};
use ulid::Ulid;

use crate::error::SessionError;
use crate::interpreter::{InterpreterBackend, OutputChunk, Stream};
use crate::interrupt::{InterruptFlag, StopHandle};
use crate::pending::PendingCalls;
use crate::store::FileStore;
use crate::worker::{self, WorkerHandle, WorkerOptions};

const DEFAULT_REQUIREMENTS_FILE: &str = "requirements.txt";

// ═══════════════════════════════════════════════════════════════════════════════
// State machine
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Running,
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    InitRequested,
    InitSucceeded,
    InitFailed,
    RunRequested,
    /// The run's terminal event arrived without a cancellation fault.
    RunFinished { stop_requested: bool },
    /// The run ended with an interruption fault.
    RunInterrupted,
    /// The execution thread died or broke the protocol.
    TransportFault,
}

/// Pure lifecycle transition. Requests that are illegal in the current state
/// are rejected, never queued.
pub fn next_state(state: SessionState, event: SessionEvent) -> Result<SessionState, SessionError> {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (_, E::TransportFault) => Ok(S::Faulted),
        (S::Faulted, E::InitRequested | E::RunRequested) => Err(SessionError::Faulted),
        (S::Uninitialized, E::InitRequested) => Ok(S::Initializing),
        (S::Initializing, E::InitSucceeded) => Ok(S::Ready),
        (S::Initializing, E::InitFailed) => Ok(S::Faulted),
        (S::Ready, E::RunRequested) => Ok(S::Running),
        (S::Running, E::RunFinished { stop_requested: false }) => Ok(S::Ready),
        (S::Running, E::RunFinished { stop_requested: true }) => Ok(S::Faulted),
        (S::Running, E::RunInterrupted) => Ok(S::Faulted),
        (state, event) => Err(SessionError::InvalidState {
            operation: operation_name(event),
            state,
        }),
    }
}

fn operation_name(event: SessionEvent) -> &'static str {
    match event {
        SessionEvent::InitRequested => "init",
        SessionEvent::InitSucceeded | SessionEvent::InitFailed => "complete init",
        SessionEvent::RunRequested => "run",
        SessionEvent::RunFinished { .. } | SessionEvent::RunInterrupted => "complete run",
        SessionEvent::TransportFault => "fault",
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Output
// ═══════════════════════════════════════════════════════════════════════════════

/// Receives script output in emission order.
pub trait OutputSink: Send {
    fn stdout(&mut self, text: &str);
    fn stderr(&mut self, text: &str);
}

/// Sink that keeps every chunk, for callers that want output after the run.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub chunks: Vec<OutputChunk>,
}

impl CapturedOutput {
    pub fn stdout_lines(&self) -> Vec<&str> {
        self.lines(Stream::Stdout)
    }

    pub fn stderr_lines(&self) -> Vec<&str> {
        self.lines(Stream::Stderr)
    }

    fn lines(&self, stream: Stream) -> Vec<&str> {
        self.chunks
            .iter()
            .filter(|chunk| chunk.stream == stream)
            .map(|chunk| chunk.text.as_str())
            .collect()
    }
}

impl OutputSink for CapturedOutput {
    fn stdout(&mut self, text: &str) {
        self.chunks.push(OutputChunk::stdout(text));
    }

    fn stderr(&mut self, text: &str) {
        self.chunks.push(OutputChunk::stderr(text));
    }
}

impl<S: OutputSink + ?Sized> OutputSink for Box<S> {
    fn stdout(&mut self, text: &str) {
        (**self).stdout(text);
    }

    fn stderr(&mut self, text: &str) {
        (**self).stderr(text);
    }
}

/// Shared handle to a sink, so a caller can read what a session wrote. A
/// reader that panicked while holding the lock does not cost any output.
impl<S: OutputSink> OutputSink for Arc<Mutex<S>> {
    fn stdout(&mut self, text: &str) {
        self.lock().unwrap_or_else(PoisonError::into_inner).stdout(text);
    }

    fn stderr(&mut self, text: &str) {
        self.lock().unwrap_or_else(PoisonError::into_inner).stderr(text);
    }
}

/// Sink that drops output, logging it at trace level.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn stdout(&mut self, text: &str) {
        tracing::trace!(%text, "Discarded stdout");
    }

    fn stderr(&mut self, text: &str) {
        tracing::trace!(%text, "Discarded stderr");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session
// ═══════════════════════════════════════════════════════════════════════════════

/// What a run evaluated to. `error` holds the formatted traceback of an
/// uncaught exception in the script; the session stays usable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub value: Option<String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

pub struct ExecutionSession {
    id: Ulid,
    state: SessionState,
    interrupt: InterruptFlag,
    pending: PendingCalls,
    backend: Arc<dyn InterpreterBackend>,
    store: Arc<dyn FileStore>,
    requirements_file: String,
    sink: Box<dyn OutputSink>,
    worker: Option<WorkerHandle>,
}

impl std::fmt::Debug for ExecutionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("root", &self.store.root())
            .finish()
    }
}

impl ExecutionSession {
    pub fn new(
        backend: Arc<dyn InterpreterBackend>,
        store: Arc<dyn FileStore>,
        sink: Box<dyn OutputSink>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            state: SessionState::Uninitialized,
            interrupt: InterruptFlag::new(),
            pending: PendingCalls::new(),
            backend,
            store,
            requirements_file: DEFAULT_REQUIREMENTS_FILE.to_string(),
            sink,
            worker: None,
        }
    }

    pub fn with_requirements_file(mut self, name: impl Into<String>) -> Self {
        self.requirements_file = name.into();
        self
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_faulted(&self) -> bool {
        self.state == SessionState::Faulted
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn interrupt_flag(&self) -> &InterruptFlag {
        &self.interrupt
    }

    /// Handle for stopping this session from another thread while `run` blocks.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.interrupt.clone())
    }

    /// Requests an interrupt. No message is sent and nothing is acknowledged.
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    /// Starts the execution thread and launches the interpreter.
    pub fn init(&mut self) -> Result<(), SessionError> {
        self.transition(SessionEvent::InitRequested)?;

        let handle = worker::spawn(WorkerOptions {
            session_id: self.id,
            backend: Arc::clone(&self.backend),
            store: Arc::clone(&self.store),
            interrupt: self.interrupt.clone(),
            requirements_file: self.requirements_file.clone(),
        });
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                self.fault();
                return Err(SessionError::Transport(format!(
                    "Failed to start execution thread: {}",
                    err
                )));
            }
        };
        self.worker = Some(handle);

        let id = self.pending.register(RequestKind::Init);
        self.send(Request::Init { id })?;
        match self.await_terminal(id)? {
            Event::Finished { .. } => {
                self.transition(SessionEvent::InitSucceeded)?;
                tracing::info!(session = %self.id, root = %self.store.root().display(), "Session ready");
                Ok(())
            }
            Event::Error { error, .. } => {
                self.transition(SessionEvent::InitFailed)?;
                tracing::warn!(session = %self.id, error = %error, "Session failed to start");
                Err(SessionError::Worker(error))
            }
            other => Err(self.protocol_fault(format!("unexpected terminal event {:?}", other))),
        }
    }

    /// Runs `script` and blocks until its terminal event. Output reaches the
    /// sink in emission order before this returns.
    pub fn run(
        &mut self,
        script: &str,
        filename: Option<&str>,
    ) -> Result<ExecutionResult, SessionError> {
        self.transition(SessionEvent::RunRequested)?;
        self.interrupt.reset();

        let id = self.pending.register(RequestKind::Run);
        tracing::debug!(session = %self.id, id, filename = ?filename, "Run requested");
        self.send(Request::Run {
            id,
            script: script.to_string(),
            filename: filename.map(str::to_string),
        })?;

        let terminal = self.await_terminal(id)?;
        let stop_requested = self.interrupt.is_requested();
        match terminal {
            Event::Finished { result, error, .. } => {
                self.transition(SessionEvent::RunFinished { stop_requested })?;
                if stop_requested {
                    tracing::info!(session = %self.id, "Run finished after stop; session discarded");
                }
                Ok(ExecutionResult {
                    value: result,
                    error,
                })
            }
            Event::Error { error, .. }
                if error.code == codes::INTERRUPTED && !stop_requested =>
            {
                self.transition(SessionEvent::RunFinished {
                    stop_requested: false,
                })?;
                Ok(ExecutionResult {
                    value: None,
                    error: Some(error.message),
                })
            }
            Event::Error { error, .. } => Err(self.run_failed(error, stop_requested)),
            other => Err(self.protocol_fault(format!("unexpected terminal event {:?}", other))),
        }
    }

    fn run_failed(&mut self, error: ErrorInfo, stop_requested: bool) -> SessionError {
        match error.code.as_str() {
            codes::INTERRUPTED => {
                let _ = self.transition(SessionEvent::RunInterrupted);
                tracing::info!(session = %self.id, "Run interrupted; session discarded");
                SessionError::Interrupted {
                    message: error.message,
                }
            }
            // The store refused the mount; the interpreter is untouched.
            codes::MOUNT_FAILED => {
                let _ = self.transition(SessionEvent::RunFinished { stop_requested });
                SessionError::Worker(error)
            }
            _ => {
                tracing::warn!(session = %self.id, error = %error, "Execution thread fault");
                self.fault();
                SessionError::Worker(error)
            }
        }
    }

    fn send(&mut self, request: Request) -> Result<(), SessionError> {
        let id = request.id();
        let sent = match &self.worker {
            Some(worker) => worker.requests.send(request).is_ok(),
            None => false,
        };
        if sent {
            Ok(())
        } else {
            let _ = self.pending.complete(id);
            Err(self.transport_fault("execution thread is not running"))
        }
    }

    /// Dispatches events until the terminal event for `id` arrives.
    fn await_terminal(&mut self, id: CorrelationId) -> Result<Event, SessionError> {
        loop {
            let received = match &self.worker {
                Some(worker) => worker.events.recv().ok(),
                None => None,
            };
            let Some(event) = received else {
                return Err(self.transport_fault("execution thread exited"));
            };

            match event.terminal_id() {
                None => self.deliver(event),
                Some(terminal_id) => {
                    let call = match self.pending.complete(terminal_id) {
                        Ok(call) => call,
                        Err(err) => {
                            tracing::warn!(session = %self.id, error = %err, "Dropping session");
                            self.fault();
                            return Err(err);
                        }
                    };
                    tracing::debug!(
                        session = %self.id,
                        id = call.id,
                        kind = ?call.kind,
                        elapsed_ms = call.elapsed().as_millis() as u64,
                        "Call resolved"
                    );
                    if terminal_id != id {
                        self.fault();
                        return Err(SessionError::UnknownCorrelation(terminal_id));
                    }
                    return Ok(event);
                }
            }
        }
    }

    fn deliver(&mut self, event: Event) {
        // After a stop request the caller has stopped listening.
        if self.interrupt.is_requested() {
            return;
        }
        match event {
            Event::Stdout { stdout } => self.sink.stdout(&stdout),
            Event::Stderr { stderr } => self.sink.stderr(&stderr),
            Event::Finished { .. } | Event::Error { .. } => {}
        }
    }

    fn transition(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        let next = next_state(self.state, event)?;
        if next != self.state {
            tracing::debug!(session = %self.id, from = ?self.state, to = ?next, "Session state");
        }
        self.state = next;
        Ok(())
    }

    fn transport_fault(&mut self, message: &str) -> SessionError {
        tracing::warn!(session = %self.id, %message, "Session transport fault");
        self.fault();
        SessionError::Transport(message.to_string())
    }

    fn protocol_fault(&mut self, message: String) -> SessionError {
        self.fault();
        SessionError::Worker(ErrorInfo::new(codes::MALFORMED_MESSAGE, message))
    }

    fn fault(&mut self) {
        self.state = SessionState::Faulted;
        let abandoned = self.pending.abandon_all();
        if !abandoned.is_empty() {
            tracing::debug!(session = %self.id, count = abandoned.len(), "Abandoned pending calls");
        }
    }
}

impl Drop for ExecutionSession {
    fn drop(&mut self) {
        // A worker still busy with an abandoned run gets interrupted; an idle
        // one exits when its request channel closes.
        if self.state == SessionState::Running || self.state == SessionState::Faulted {
            self.interrupt.request();
        }
        if let Some(worker) = self.worker.take() {
            drop(worker.requests);
            if worker.thread.is_finished() {
                let _ = worker.thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;
    use crate::interpreter::Outcome;
    use crate::testing::ScriptedBackend;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn session(root: &std::path::Path) -> (ExecutionSession, Arc<Mutex<CapturedOutput>>) {
        let output = Arc::new(Mutex::new(CapturedOutput::default()));
        let session = ExecutionSession::new(
            Arc::new(ScriptedBackend::new()),
            Arc::new(LocalStore::open(root).unwrap()),
            Box::new(Arc::clone(&output)),
        );
        (session, output)
    }

    #[test]
    fn transitions_follow_lifecycle() {
        use SessionEvent as E;
        use SessionState as S;
        assert_eq!(next_state(S::Uninitialized, E::InitRequested).unwrap(), S::Initializing);
        assert_eq!(next_state(S::Initializing, E::InitSucceeded).unwrap(), S::Ready);
        assert_eq!(next_state(S::Initializing, E::InitFailed).unwrap(), S::Faulted);
        assert_eq!(next_state(S::Ready, E::RunRequested).unwrap(), S::Running);
        assert_eq!(
            next_state(S::Running, E::RunFinished { stop_requested: false }).unwrap(),
            S::Ready
        );
        assert_eq!(
            next_state(S::Running, E::RunFinished { stop_requested: true }).unwrap(),
            S::Faulted
        );
        assert_eq!(next_state(S::Running, E::RunInterrupted).unwrap(), S::Faulted);
    }

    #[test]
    fn transport_fault_from_any_state() {
        for state in [
            SessionState::Uninitialized,
            SessionState::Initializing,
            SessionState::Ready,
            SessionState::Running,
            SessionState::Faulted,
        ] {
            assert_eq!(
                next_state(state, SessionEvent::TransportFault).unwrap(),
                SessionState::Faulted
            );
        }
    }

    #[test]
    fn illegal_requests_are_rejected() {
        assert!(matches!(
            next_state(SessionState::Running, SessionEvent::RunRequested),
            Err(SessionError::InvalidState { operation: "run", state: SessionState::Running })
        ));
        assert!(matches!(
            next_state(SessionState::Uninitialized, SessionEvent::RunRequested),
            Err(SessionError::InvalidState { .. })
        ));
        assert!(matches!(
            next_state(SessionState::Ready, SessionEvent::InitRequested),
            Err(SessionError::InvalidState { .. })
        ));
        assert!(matches!(
            next_state(SessionState::Faulted, SessionEvent::RunRequested),
            Err(SessionError::Faulted)
        ));
    }

    #[test]
    fn run_before_init_is_invalid() {
        let temp = TempDir::new().unwrap();
        let (mut session, _) = session(temp.path());
        assert!(matches!(
            session.run("print(1)", None),
            Err(SessionError::InvalidState { .. })
        ));
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[test]
    fn run_streams_output_then_resolves() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.py"), "print(1)").unwrap();
        let (mut session, output) = session(temp.path());
        session.init().unwrap();
        let result = session.run("print(1)", Some("a.py")).unwrap();
        assert_eq!(result, ExecutionResult::default());
        assert_eq!(output.lock().unwrap().stdout_lines(), vec!["1"]);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.pending_calls(), 0);
    }

    #[test]
    fn script_exception_keeps_session_ready() {
        let temp = TempDir::new().unwrap();
        let (mut session, _) = session(temp.path());
        session.init().unwrap();
        let result = session.run("raise ValueError('x')", Some("a.py")).unwrap();
        assert!(result.is_error());
        assert_eq!(session.state(), SessionState::Ready);
        let again = session.run("result(2)", None).unwrap();
        assert_eq!(again.value.as_deref(), Some("2"));
    }

    #[test]
    fn script_raised_keyboard_interrupt_is_a_script_error() {
        let temp = TempDir::new().unwrap();
        let backend = ScriptedBackend::new().with_canned(
            "KeyboardInterrupt",
            Outcome::Interrupted {
                traceback: "KeyboardInterrupt: user".to_string(),
            },
        );
        let mut session = ExecutionSession::new(
            Arc::new(backend),
            Arc::new(LocalStore::open(temp.path()).unwrap()),
            Box::new(NullSink),
        );
        session.init().unwrap();
        let result = session
            .run("raise KeyboardInterrupt('user')", Some("a.py"))
            .unwrap();
        assert_eq!(result.error.as_deref(), Some("KeyboardInterrupt: user"));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.run("result(1)", None).unwrap().value.as_deref(), Some("1"));
    }

    #[test]
    fn poisoned_shared_sink_still_receives_output() {
        let shared = Arc::new(Mutex::new(CapturedOutput::default()));
        let poisoner = Arc::clone(&shared);
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("reader panicked");
        })
        .join();
        assert!(shared.is_poisoned());

        let mut sink = Arc::clone(&shared);
        sink.stdout("still here");
        let captured = shared.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(captured.stdout_lines(), vec!["still here"]);
    }

    #[test]
    fn stop_before_run_does_not_leak_into_next_run() {
        let temp = TempDir::new().unwrap();
        let (mut session, output) = session(temp.path());
        session.init().unwrap();
        session.stop();
        let result = session.run("print(1)", None).unwrap();
        assert!(!result.is_error());
        assert_eq!(output.lock().unwrap().stdout_lines(), vec!["1"]);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn stop_during_run_faults_session() {
        let temp = TempDir::new().unwrap();
        let (mut session, _) = session(temp.path());
        session.init().unwrap();
        let handle = session.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            handle.stop();
        });
        let err = session.run("while True: pass", Some("loop.py")).unwrap_err();
        stopper.join().unwrap();
        assert!(err.is_interruption());
        assert_eq!(session.state(), SessionState::Faulted);
        assert!(matches!(session.run("print(1)", None), Err(SessionError::Faulted)));
    }

    #[test]
    fn stop_after_clean_finish_still_faults() {
        let temp = TempDir::new().unwrap();
        let (mut session, output) = session(temp.path());
        session.init().unwrap();
        let handle = session.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            handle.stop();
        });
        let result = session.run("sleep(60)\nprint(late)", None).unwrap();
        stopper.join().unwrap();
        assert!(!result.is_error());
        assert_eq!(session.state(), SessionState::Faulted);
        // Output after the stop request is muted.
        assert!(output.lock().unwrap().stdout_lines().is_empty());
    }

    #[test]
    fn interpreter_death_is_a_transport_fault() {
        let temp = TempDir::new().unwrap();
        let (mut session, _) = session(temp.path());
        session.init().unwrap();
        match session.run("exit()", None) {
            Err(SessionError::Worker(info)) => assert_eq!(info.code, codes::INTERPRETER_EXITED),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(session.is_faulted());
    }

    #[test]
    fn launch_failure_faults_during_init() {
        let temp = TempDir::new().unwrap();
        let mut session = ExecutionSession::new(
            Arc::new(ScriptedBackend::failing()),
            Arc::new(LocalStore::open(temp.path()).unwrap()),
            Box::new(NullSink),
        );
        match session.init() {
            Err(SessionError::Worker(info)) => assert_eq!(info.code, codes::LAUNCH_FAILED),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(session.is_faulted());
    }

    #[test]
    fn second_init_is_rejected() {
        let temp = TempDir::new().unwrap();
        let (mut session, _) = session(temp.path());
        session.init().unwrap();
        assert!(matches!(session.init(), Err(SessionError::InvalidState { .. })));
        assert_eq!(session.state(), SessionState::Ready);
    }
}
