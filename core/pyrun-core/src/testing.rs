//! Deterministic interpreter for tests.
//!
//! [`ScriptedBackend`] understands a tiny line-oriented script language, just
//! enough to exercise sessions, the worker and the type-check scheduler
//! without a Python installation:
//!
//! | Line | Effect |
//! |------|--------|
//! | `print(x)` | stdout line `x` (quotes stripped) |
//! | `eprint(x)` | stderr line `x` |
//! | `result(x)` | the run evaluates to `x` |
//! | `raise E(msg)` | uncaught exception with a traceback |
//! | `while True: pass` | spins until interrupted |
//! | `sleep(ms)` | sleeps, ignoring interrupts |
//! | `write("path", "text")` | writes a file relative to the working directory |
//! | `read("path")` | prints a file relative to the working directory |
//! | `exit()` | the interpreter process dies |
//! | `garbage()` | the interpreter sends a malformed message |
//!
//! Blank lines, comments and `import` lines are ignored. Scripts containing a
//! registered needle (see [`ScriptedBackend::with_canned`]) short-circuit to
//! the canned outcome instead; [`ScriptedBackend::with_crash`] needles make
//! the interpreter process die.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::InterpreterError;
use crate::interpreter::{
    ExecRequest, InstallReport, Interpreter, InterpreterBackend, OutputChunk, Outcome,
};
use crate::interrupt::InterruptFlag;

#[derive(Debug, Default)]
struct Recorder {
    launches: usize,
    executions: usize,
    evictions: usize,
    installed: Vec<String>,
    scripts: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    recorder: Arc<Mutex<Recorder>>,
    canned: Vec<(String, Outcome)>,
    crashes: Vec<String>,
    fail_launch: bool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose interpreter never starts.
    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::default()
        }
    }

    /// Any script containing `needle` ends with `outcome`.
    pub fn with_canned(mut self, needle: &str, outcome: Outcome) -> Self {
        self.canned.push((needle.to_string(), outcome));
        self
    }

    /// Any script containing `needle` kills the interpreter.
    pub fn with_crash(mut self, needle: &str) -> Self {
        self.crashes.push(needle.to_string());
        self
    }

    pub fn launches(&self) -> usize {
        self.recorder.lock().unwrap().launches
    }

    pub fn executions(&self) -> usize {
        self.recorder.lock().unwrap().executions
    }

    pub fn evictions(&self) -> usize {
        self.recorder.lock().unwrap().evictions
    }

    pub fn installed(&self) -> Vec<String> {
        self.recorder.lock().unwrap().installed.clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.recorder.lock().unwrap().scripts.clone()
    }
}

impl InterpreterBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn launch(&self) -> Result<Box<dyn Interpreter>, InterpreterError> {
        if self.fail_launch {
            return Err(InterpreterError::Launch("scripted launch failure".to_string()));
        }
        self.recorder.lock().unwrap().launches += 1;
        Ok(Box::new(ScriptedInterpreter {
            recorder: Arc::clone(&self.recorder),
            canned: self.canned.clone(),
            crashes: self.crashes.clone(),
        }))
    }
}

struct ScriptedInterpreter {
    recorder: Arc<Mutex<Recorder>>,
    canned: Vec<(String, Outcome)>,
    crashes: Vec<String>,
}

impl Interpreter for ScriptedInterpreter {
    fn install(
        &mut self,
        requirements: &[String],
        _interrupt: &InterruptFlag,
        output: &mut dyn FnMut(OutputChunk),
    ) -> Result<InstallReport, InterpreterError> {
        let mut report = InstallReport::default();
        for requirement in requirements {
            if requirement.contains("missing") {
                output(OutputChunk::stderr(format!(
                    "Failed to install {}: no matching distribution",
                    requirement
                )));
                report.failed.push(requirement.clone());
            } else {
                report.installed.push(requirement.clone());
            }
        }
        self.recorder
            .lock()
            .unwrap()
            .installed
            .extend(report.installed.iter().cloned());
        Ok(report)
    }

    fn evict_modules(&mut self, _prefix: &Path) -> Result<usize, InterpreterError> {
        self.recorder.lock().unwrap().evictions += 1;
        Ok(0)
    }

    fn execute(
        &mut self,
        request: ExecRequest<'_>,
        interrupt: &InterruptFlag,
        output: &mut dyn FnMut(OutputChunk),
    ) -> Result<Outcome, InterpreterError> {
        {
            let mut recorder = self.recorder.lock().unwrap();
            recorder.executions += 1;
            recorder.scripts.push(request.source.to_string());
        }
        if self
            .crashes
            .iter()
            .any(|needle| request.source.contains(needle.as_str()))
        {
            return Err(InterpreterError::Exited {
                status: "signal: 9 (SIGKILL)".to_string(),
            });
        }
        if let Some((_, outcome)) = self
            .canned
            .iter()
            .find(|(needle, _)| request.source.contains(needle.as_str()))
        {
            return Ok(outcome.clone());
        }

        let filename = request.filename.unwrap_or("<exec>");
        let mut value = None;
        for (index, raw) in request.source.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("import ") {
                continue;
            }
            if let Some(arg) = call_args(line, "print") {
                output(OutputChunk::stdout(literal(arg)));
            } else if let Some(arg) = call_args(line, "eprint") {
                output(OutputChunk::stderr(literal(arg)));
            } else if let Some(arg) = call_args(line, "result") {
                value = Some(literal(arg));
            } else if let Some(arg) = call_args(line, "sleep") {
                let ms = arg.trim().parse::<u64>().unwrap_or(0);
                thread::sleep(Duration::from_millis(ms));
            } else if let Some(args) = call_args(line, "write") {
                let parts = split_args(args);
                let path = request.cwd.join(literal(parts.first().copied().unwrap_or("")));
                let text = literal(parts.get(1).copied().unwrap_or(""));
                if let Err(err) = std::fs::write(&path, text) {
                    return Ok(raised(filename, index, &format!("OSError: {}", err)));
                }
            } else if let Some(arg) = call_args(line, "read") {
                match std::fs::read_to_string(request.cwd.join(literal(arg))) {
                    Ok(content) => {
                        for text in content.lines() {
                            output(OutputChunk::stdout(text));
                        }
                    }
                    Err(err) => {
                        return Ok(raised(filename, index, &format!("FileNotFoundError: {}", err)))
                    }
                }
            } else if line == "while True: pass" {
                while !interrupt.is_requested() {
                    thread::sleep(Duration::from_millis(1));
                }
                return Ok(Outcome::Interrupted {
                    traceback: raised_text(filename, index, "KeyboardInterrupt"),
                });
            } else if let Some(exception) = line.strip_prefix("raise ") {
                return Ok(raised(filename, index, exception.trim()));
            } else if line == "exit()" {
                return Err(InterpreterError::Exited {
                    status: "exit status: 1".to_string(),
                });
            } else if line == "garbage()" {
                return Err(InterpreterError::Malformed(
                    "driver reply was not valid JSON".to_string(),
                ));
            } else {
                return Ok(raised(
                    filename,
                    index,
                    &format!("SyntaxError: unsupported statement {:?}", line),
                ));
            }
        }
        Ok(Outcome::Completed { value })
    }
}

fn call_args<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    line.strip_prefix(name)?
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn literal(arg: &str) -> String {
    let arg = arg.trim();
    for quote in ['"', '\''] {
        if arg.len() >= 2 && arg.starts_with(quote) && arg.ends_with(quote) {
            return arg[1..arg.len() - 1].to_string();
        }
    }
    arg.to_string()
}

fn split_args(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (index, ch) in args.char_indices() {
        match (quote, ch) {
            (None, '"' | '\'') => quote = Some(ch),
            (Some(open), _) if ch == open => quote = None,
            (None, ',') => {
                parts.push(&args[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&args[start..]);
    parts
}

fn raised_text(filename: &str, index: usize, exception: &str) -> String {
    format!(
        "Traceback (most recent call last):\n  File \"{}\", line {}, in <module>\n{}",
        filename,
        index + 1,
        exception
    )
}

fn raised(filename: &str, index: usize, exception: &str) -> Outcome {
    Outcome::Raised {
        traceback: raised_text(filename, index, exception),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execute(source: &str) -> (Vec<OutputChunk>, Result<Outcome, InterpreterError>) {
        let temp = tempfile::TempDir::new().unwrap();
        let mut interpreter = ScriptedBackend::new().launch().unwrap();
        let mut chunks = Vec::new();
        let outcome = interpreter.execute(
            ExecRequest {
                source,
                filename: Some("a.py"),
                cwd: temp.path(),
            },
            &InterruptFlag::new(),
            &mut |chunk| chunks.push(chunk),
        );
        (chunks, outcome)
    }

    #[test]
    fn prints_and_returns_value() {
        let (chunks, outcome) = execute("print(1)\neprint('warn')\nresult(\"done\")");
        assert_eq!(
            chunks,
            vec![OutputChunk::stdout("1"), OutputChunk::stderr("warn")]
        );
        assert_eq!(
            outcome.unwrap(),
            Outcome::Completed {
                value: Some("done".to_string())
            }
        );
    }

    #[test]
    fn raise_reports_traceback_with_filename() {
        let (_, outcome) = execute("print(1)\nraise ValueError('bad')");
        match outcome.unwrap() {
            Outcome::Raised { traceback } => {
                assert!(traceback.contains("File \"a.py\", line 2"));
                assert!(traceback.ends_with("ValueError('bad')"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn spin_loop_honours_interrupt() {
        let mut interpreter = ScriptedBackend::new().launch().unwrap();
        let flag = InterruptFlag::new();
        let stopper = flag.clone();
        let timer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stopper.request();
        });
        let temp = tempfile::TempDir::new().unwrap();
        let outcome = interpreter
            .execute(
                ExecRequest {
                    source: "while True: pass",
                    filename: Some("loop.py"),
                    cwd: temp.path(),
                },
                &flag,
                &mut |_| {},
            )
            .unwrap();
        timer.join().unwrap();
        assert!(matches!(outcome, Outcome::Interrupted { .. }));
    }

    #[test]
    fn canned_outcome_wins() {
        let backend = ScriptedBackend::new().with_canned(
            "mypy",
            Outcome::Completed {
                value: Some("[]".to_string()),
            },
        );
        let mut interpreter = backend.launch().unwrap();
        let temp = tempfile::TempDir::new().unwrap();
        let outcome = interpreter
            .execute(
                ExecRequest {
                    source: "import mypy",
                    filename: None,
                    cwd: temp.path(),
                },
                &InterruptFlag::new(),
                &mut |_| {},
            )
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Completed {
                value: Some("[]".to_string())
            }
        );
        assert_eq!(backend.executions(), 1);
    }

    #[test]
    fn failed_installs_do_not_abort_batch() {
        let backend = ScriptedBackend::new();
        let mut interpreter = backend.launch().unwrap();
        let requirements = vec!["requests".to_string(), "missing-pkg".to_string(), "six".to_string()];
        let report = interpreter
            .install(&requirements, &InterruptFlag::new(), &mut |_| {})
            .unwrap();
        assert_eq!(report.installed, vec!["requests", "six"]);
        assert_eq!(report.failed, vec!["missing-pkg"]);
        assert_eq!(backend.installed(), vec!["requests", "six"]);
    }

    #[test]
    fn splits_quoted_arguments() {
        assert_eq!(split_args("\"a,b\", 'c'"), vec!["\"a,b\"", " 'c'"]);
    }
}
