//! End-to-end checks against a real `python3`. Skipped when none is on PATH.

use pyrun_core::{
    CapturedOutput, ExecRequest, ExecutionSession, Interpreter, InterpreterBackend, InterruptFlag,
    LocalStore, NullSink, OutputChunk, Outcome, PythonBackend, SessionState, Stream,
};
use std::path::Path;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn python() -> Option<PathBuf> {
    match which::which("python3") {
        Ok(path) => Some(path),
        Err(_) => {
            eprintln!("python3 not found, skipping");
            None
        }
    }
}

fn execute_in(
    interpreter: &mut dyn Interpreter,
    cwd: &Path,
    source: &str,
) -> (Vec<OutputChunk>, Outcome) {
    let mut chunks = Vec::new();
    let outcome = interpreter
        .execute(
            ExecRequest {
                source,
                filename: Some("main.py"),
                cwd,
            },
            &InterruptFlag::new(),
            &mut |chunk| chunks.push(chunk),
        )
        .unwrap();
    (chunks, outcome)
}

fn execute(backend: &PythonBackend, source: &str) -> (Vec<OutputChunk>, Outcome) {
    let temp = TempDir::new().unwrap();
    let mut interpreter = backend.launch().unwrap();
    execute_in(interpreter.as_mut(), temp.path(), source)
}

#[test]
fn test_print_streams_stdout() {
    let Some(program) = python() else { return };
    let (chunks, outcome) = execute(&PythonBackend::new(program), "print(1)");
    assert_eq!(chunks, vec![OutputChunk::stdout("1")]);
    assert_eq!(outcome, Outcome::Completed { value: None });
}

#[test]
fn test_trailing_expression_is_the_value() {
    let Some(program) = python() else { return };
    let backend = PythonBackend::new(program);

    let (_, outcome) = execute(&backend, "x = 20\nx + 22");
    assert_eq!(outcome, Outcome::Completed { value: Some("42".to_string()) });

    let (_, outcome) = execute(&backend, "'text'");
    assert_eq!(outcome, Outcome::Completed { value: Some("text".to_string()) });

    let (_, outcome) = execute(&backend, "None");
    assert_eq!(outcome, Outcome::Completed { value: None });
}

#[test]
fn test_uncaught_exception_yields_traceback() {
    let Some(program) = python() else { return };
    let (chunks, outcome) = execute(&PythonBackend::new(program), "print('before')\n1 / 0");
    assert_eq!(chunks, vec![OutputChunk::stdout("before")]);
    let Outcome::Raised { traceback } = outcome else {
        panic!("expected a traceback, got {:?}", outcome);
    };
    assert!(traceback.contains("File \"main.py\", line 2"));
    assert!(traceback.contains("ZeroDivisionError"));
    assert!(!traceback.contains("run_source"));
}

#[test]
fn test_stderr_is_kept_separate() {
    let Some(program) = python() else { return };
    let (chunks, _) = execute(
        &PythonBackend::new(program),
        "import sys\nprint('out')\nprint('err', file=sys.stderr)",
    );
    assert!(chunks.contains(&OutputChunk::stdout("out")));
    assert!(chunks
        .iter()
        .any(|chunk| chunk.stream == Stream::Stderr && chunk.text == "err"));
}

#[test]
fn test_infinite_loop_is_interruptible() {
    let Some(program) = python() else { return };
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("main.py"), "while True: pass\n").unwrap();
    let output = Arc::new(Mutex::new(CapturedOutput::default()));
    let mut session = ExecutionSession::new(
        Arc::new(PythonBackend::new(program)),
        Arc::new(LocalStore::open(temp.path()).unwrap()),
        Box::new(Arc::clone(&output)),
    );
    session.init().unwrap();

    let stop = session.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        stop.stop();
    });
    let err = session.run("while True: pass", Some("main.py")).unwrap_err();
    stopper.join().unwrap();

    assert!(err.is_interruption());
    assert_eq!(session.state(), SessionState::Faulted);
}

#[test]
fn test_session_sees_project_modules() {
    let Some(program) = python() else { return };
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("helper.py"), "GREETING = 'hi'\n").unwrap();
    let mut session = ExecutionSession::new(
        Arc::new(PythonBackend::new(program)),
        Arc::new(LocalStore::open(temp.path()).unwrap()),
        Box::new(CapturedOutput::default()),
    );
    session.init().unwrap();

    let result = session
        .run("import helper\nhelper.GREETING", Some("main.py"))
        .unwrap();
    assert_eq!(result.value.as_deref(), Some("hi"));

    // Edits between runs are picked up because project modules are evicted.
    std::fs::write(temp.path().join("helper.py"), "GREETING = 'hello'\n").unwrap();
    let result = session
        .run("import helper\nhelper.GREETING", Some("main.py"))
        .unwrap();
    assert_eq!(result.value.as_deref(), Some("hello"));
}

#[test]
fn test_lone_surrogate_output_is_escaped() {
    let Some(program) = python() else { return };
    let (chunks, outcome) = execute(&PythonBackend::new(program), "print('\\udcff')\n'ok'");
    assert_eq!(chunks, vec![OutputChunk::stdout("\\udcff")]);
    assert_eq!(outcome, Outcome::Completed { value: Some("ok".to_string()) });
}

#[test]
fn test_binary_stderr_does_not_break_later_writes() {
    let Some(program) = python() else { return };
    let temp = TempDir::new().unwrap();
    let mut interpreter = PythonBackend::new(program).launch().unwrap();

    let (chunks, outcome) = execute_in(
        interpreter.as_mut(),
        temp.path(),
        "import os\nos.write(2, b'\\xff\\n')\nfor _ in range(2000):\n    os.write(2, b'x' * 100 + b'\\n')",
    );
    assert_eq!(outcome, Outcome::Completed { value: None });
    assert_eq!(chunks[0], OutputChunk::stderr("\u{FFFD}"));
    assert_eq!(chunks.len(), 2001);

    let (chunks, outcome) = execute_in(
        interpreter.as_mut(),
        temp.path(),
        "import os\n_ = os.write(2, b'again\\n')",
    );
    assert_eq!(outcome, Outcome::Completed { value: None });
    assert_eq!(chunks, vec![OutputChunk::stderr("again")]);
}

#[test]
fn test_child_process_output_belongs_to_its_run() {
    let Some(program) = python() else { return };
    let temp = TempDir::new().unwrap();
    let mut interpreter = PythonBackend::new(program).launch().unwrap();
    let script = "import subprocess, sys\n_ = subprocess.run([sys.executable, '-c', 'print(\"from-child\")'])";

    for run in 0..30 {
        let (chunks, outcome) = execute_in(interpreter.as_mut(), temp.path(), script);
        assert_eq!(outcome, Outcome::Completed { value: None }, "run {}", run);
        assert_eq!(chunks, vec![OutputChunk::stderr("from-child")], "run {}", run);
    }
}

#[test]
fn test_script_raising_keyboard_interrupt_keeps_session() {
    let Some(program) = python() else { return };
    let temp = TempDir::new().unwrap();
    let mut session = ExecutionSession::new(
        Arc::new(PythonBackend::new(program)),
        Arc::new(LocalStore::open(temp.path()).unwrap()),
        Box::new(NullSink),
    );
    session.init().unwrap();

    let result = session
        .run("raise KeyboardInterrupt('user')", Some("main.py"))
        .unwrap();
    assert!(result.error.unwrap().contains("KeyboardInterrupt: user"));
    assert_eq!(session.state(), SessionState::Ready);

    let result = session.run("1 + 1", Some("main.py")).unwrap();
    assert_eq!(result.value.as_deref(), Some("2"));
}
