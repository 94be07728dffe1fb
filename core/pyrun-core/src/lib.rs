//! # pyrun-core
//!
//! Core library for pyrun: runs Python scripts from a project directory in an
//! isolated interpreter on a separate execution thread, streams their output,
//! lets the user cancel a run, and re-type-checks the project in the
//! background when its sources change.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. Blocking calls (`init`,
//!   `run`) are paired with handles that work from other threads.
//! - **Message passing only**: The controller and an execution thread share
//!   nothing but one interrupt byte; everything else is sent over channels.
//! - **Disposable sessions**: A session that faulted or was stopped is never
//!   reused. Recovery is building a new one.
//! - **Collaborators behind traits**: The file store, the interpreter, the
//!   renderer and selection persistence are all replaceable.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pyrun_core::{ExecutionSession, LocalStore, PythonBackend, RunnerConfig, StorageConfig};
//!
//! let config = RunnerConfig::load(&StorageConfig::from_home()?)?;
//! let backend = Arc::new(PythonBackend::from_config(&config)?);
//! let store = Arc::new(LocalStore::open("./project")?);
//! let mut session = ExecutionSession::new(backend, store, Box::new(CapturedOutput::default()));
//! session.init()?;
//! let result = session.run("print(1)", Some("main.py"))?;
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod fingerprint;
pub mod interpreter;
pub mod interrupt;
pub mod pending;
pub mod requirements;
pub mod selection;
pub mod session;
pub mod store;
pub mod typecheck;
mod worker;

#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

pub use config::{RunnerConfig, StorageConfig};
pub use controller::{
    shared_sink, AppEvent, AppState, Controller, ControllerStop, Controls, Renderer,
    SessionRegistry, SharedSink, StyledText, TextKind, ENTRY_OUTSIDE_PROJECT,
};
pub use error::{
    ConfigError, ControllerError, InterpreterError, PyrunError, Result, SessionError, StoreError,
    TypeCheckError,
};
pub use fingerprint::{ChangeDetectionCache, ChangeOutcome, Fingerprint};
pub use interpreter::{
    ExecRequest, InstallReport, Interpreter, InterpreterBackend, OutputChunk, Outcome,
    PythonBackend, Stream,
};
pub use interrupt::{InterruptFlag, StopHandle, REQUEST_INTERRUPT, RUNNING};
pub use pending::{PendingCall, PendingCalls};
pub use selection::{JsonSelectionStore, Selection, SelectionStore};
pub use session::{
    CapturedOutput, ExecutionResult, ExecutionSession, NullSink, OutputSink, SessionEvent,
    SessionState,
};
pub use store::{FileStore, LocalStore, MountedView, SyncReport, WatchPattern};
pub use typecheck::{
    ReportSink, SchedulerHandle, TypeCheckReport, TypeCheckScheduler, TypeChecker,
    NO_SOURCES_INFO,
};
