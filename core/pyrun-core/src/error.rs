//! Error types for pyrun-core operations.
//!
//! Each concern has its own enum so callers can match on the failure class
//! they care about; [`PyrunError`] folds them together for the controller.

use pyrun_protocol::{CorrelationId, ErrorInfo};
use std::path::PathBuf;

use crate::session::SessionState;

// ═══════════════════════════════════════════════════════════════════════════════
// Interpreter
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum InterpreterError {
    #[error("Interpreter failed to launch: {0}")]
    Launch(String),

    #[error("Interpreter exited unexpectedly: {status}")]
    Exited { status: String },

    #[error("Interpreter sent a malformed message: {0}")]
    Malformed(String),

    #[error("Interpreter was interrupted during {command}")]
    Interrupted { command: String },

    #[error("Interpreter I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

// ═══════════════════════════════════════════════════════════════════════════════
// File store
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Project directory not found: {0}")]
    RootNotFound(PathBuf),

    #[error("Write access to {0} was denied")]
    PermissionDenied(PathBuf),

    #[error("Path is outside the project directory: {0}")]
    OutsideRoot(PathBuf),

    #[error("Invalid path segment: {0:?}")]
    InvalidSegment(String),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Session is faulted and must be replaced")]
    Faulted,

    #[error("Execution thread failed: {0}")]
    Transport(String),

    #[error("Execution worker reported {0}")]
    Worker(ErrorInfo),

    #[error("Run was interrupted: {message}")]
    Interrupted { message: String },

    #[error("Terminal message for unknown correlation id {0}")]
    UnknownCorrelation(CorrelationId),
}

impl SessionError {
    /// Interruptions are the only session errors a user caused on purpose.
    pub fn is_interruption(&self) -> bool {
        matches!(self, SessionError::Interrupted { .. })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Type checking
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum TypeCheckError {
    #[error("Error type checking: {0}")]
    CheckFailed(String),

    #[error("Type checker returned no result")]
    MissingResult,

    #[error("Type checker result could not be parsed: {0}")]
    Parse(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    Malformed { path: PathBuf, details: String },

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("Configuration write failed: {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No Python interpreter found (set PYRUN_PYTHON or \"python\" in config.json)")]
    PythonNotFound,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Controller
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("No project directory selected")]
    NoProject,

    #[error("No entry point selected")]
    NoEntryPoint,

    #[error("Entry point provided not in project directory.")]
    EntryOutsideProject,

    #[error("A run is already in progress")]
    AlreadyRunning,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Crate-level
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum PyrunError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    TypeCheck(#[from] TypeCheckError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Interpreter(#[from] InterpreterError),

    #[error(transparent)]
    Controller(#[from] ControllerError),
}

pub type Result<T> = std::result::Result<T, PyrunError>;

impl From<PyrunError> for String {
    fn from(err: PyrunError) -> String {
        err.to_string()
    }
}
