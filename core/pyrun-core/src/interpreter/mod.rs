//! The interpreter capability driven by an execution thread.
//!
//! Sessions only need three things from a runtime: install declared
//! dependencies, forget modules loaded from the project, and execute a script
//! while streaming its output. [`InterpreterBackend`] launches a fresh
//! [`Interpreter`] for each session; the interpreter lives on the execution
//! thread and is never shared.

pub mod python;

use std::fmt;
use std::path::Path;

use crate::error::InterpreterError;
use crate::interrupt::InterruptFlag;

pub use python::{PythonBackend, PythonInterpreter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One batch of script output, usually a single line without its newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: Stream,
    pub text: String,
}

impl OutputChunk {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: Stream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: Stream::Stderr,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecRequest<'a> {
    pub source: &'a str,
    /// Name used in tracebacks; the interpreter picks a placeholder when absent.
    pub filename: Option<&'a str>,
    /// Working directory for the script, normally the mounted project.
    pub cwd: &'a Path,
}

/// How a script ended, when the interpreter itself survived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { value: Option<String> },
    Raised { traceback: String },
    Interrupted { traceback: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub failed: Vec<String>,
}

pub trait InterpreterBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn launch(&self) -> Result<Box<dyn Interpreter>, InterpreterError>;
}

pub trait Interpreter: Send {
    /// Installs each requirement independently. A failed entry is listed in the
    /// report and does not stop the rest of the batch.
    fn install(
        &mut self,
        requirements: &[String],
        interrupt: &InterruptFlag,
        output: &mut dyn FnMut(OutputChunk),
    ) -> Result<InstallReport, InterpreterError>;

    /// Drops cached modules whose origin file lives under `prefix`.
    fn evict_modules(&mut self, prefix: &Path) -> Result<usize, InterpreterError>;

    /// Runs a script to completion. Output is handed to `output` as it is
    /// produced, so every chunk precedes the returned outcome.
    fn execute(
        &mut self,
        request: ExecRequest<'_>,
        interrupt: &InterruptFlag,
        output: &mut dyn FnMut(OutputChunk),
    ) -> Result<Outcome, InterpreterError>;
}
