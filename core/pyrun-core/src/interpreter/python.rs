//! CPython backend: a long-lived `python3` process running the embedded driver.
//!
//! The driver keeps interpreter state (most importantly the module cache)
//! alive between runs, like an embedded interpreter would. Commands and
//! replies are newline-delimited JSON; see `pyrun_protocol::DriverCommand`.
//!
//! Interruption is cooperative: on the first observed interrupt request the
//! driver receives `SIGINT`, which Python turns into `KeyboardInterrupt` at
//! its next bytecode boundary. A driver that does not answer within the
//! escalation window (native code, signal handlers swallowed) is killed.
//!
//! Script output arrives on two pipes: JSON replies carry `sys.stdout` and
//! `sys.stderr`, while anything written to the raw descriptors (child
//! processes, native code) comes in on the driver's stderr. Each `exec` ends
//! with a fence line on that pipe, and its `done` reply is held back until
//! the fence is read, so raw output never trails the run that produced it.

use pyrun_protocol::{parse_reply, DriverCommand, DriverReply, ErrorInfo};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use ulid::Ulid;

use super::{ExecRequest, InstallReport, Interpreter, InterpreterBackend, OutputChunk, Outcome};
use crate::config::RunnerConfig;
use crate::error::{ConfigError, InterpreterError};
use crate::interrupt::InterruptFlag;

const DRIVER_SOURCE: &str = include_str!("../../python/driver.py");

/// How long a fresh driver may take to answer its first ping.
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a terminal reply waits for its fence before being released.
const FENCE_WAIT: Duration = Duration::from_secs(2);

/// What the two reader threads hand over, in arrival order.
enum Incoming {
    Reply(Result<DriverReply, ErrorInfo>),
    /// One line of process-level stderr, decoded lossily.
    Raw(String),
}

#[derive(Debug, Clone)]
pub struct PythonBackend {
    program: PathBuf,
    interrupt_poll: Duration,
    escalation: Option<Duration>,
}

impl PythonBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let defaults = RunnerConfig::default();
        Self {
            program: program.into(),
            interrupt_poll: defaults.interrupt_poll(),
            escalation: defaults.interrupt_escalation(),
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            program: config.resolve_python()?,
            interrupt_poll: config.interrupt_poll(),
            escalation: config.interrupt_escalation(),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl InterpreterBackend for PythonBackend {
    fn name(&self) -> &str {
        "python"
    }

    fn launch(&self) -> Result<Box<dyn Interpreter>, InterpreterError> {
        let interpreter = PythonInterpreter::spawn(self)?;
        Ok(Box::new(interpreter))
    }
}

pub struct PythonInterpreter {
    child: Child,
    stdin: ChildStdin,
    replies: Receiver<Incoming>,
    interrupt_poll: Duration,
    escalation: Option<Duration>,
    version: String,
    fence_prefix: String,
    fences: u64,
}

impl std::fmt::Debug for PythonInterpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PythonInterpreter")
            .field("pid", &self.child.id())
            .field("version", &self.version)
            .finish()
    }
}

impl PythonInterpreter {
    fn spawn(backend: &PythonBackend) -> Result<Self, InterpreterError> {
        let mut command = Command::new(&backend.program);
        command
            .arg("-u")
            .arg("-c")
            .arg(DRIVER_SOURCE)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group: a terminal Ctrl-C goes to the controller, which
        // decides whether to forward it.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|err| {
            InterpreterError::Launch(format!("{}: {}", backend.program.display(), err))
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(InterpreterError::Launch(
                "driver pipes were not captured".to_string(),
            ));
        };

        let (tx, replies) = mpsc::channel();
        spawn_reply_reader(stdout, tx.clone())?;
        spawn_stderr_forwarder(stderr, tx)?;

        let mut interpreter = Self {
            child,
            stdin,
            replies,
            interrupt_poll: backend.interrupt_poll,
            escalation: backend.escalation,
            version: String::new(),
            fence_prefix: format!("\u{1}pyrun-fence:{}:", Ulid::new()),
            fences: 0,
        };
        interpreter.handshake()?;
        tracing::info!(
            pid = interpreter.child.id(),
            version = %interpreter.version,
            program = %backend.program.display(),
            "Python driver ready"
        );
        Ok(interpreter)
    }

    fn handshake(&mut self) -> Result<(), InterpreterError> {
        self.send(&DriverCommand::Ping)
            .map_err(|err| InterpreterError::Launch(err.to_string()))?;
        let deadline = Instant::now() + LAUNCH_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok(Incoming::Reply(Ok(DriverReply::Ready { version }))) => {
                    self.version = version;
                    return Ok(());
                }
                // Startup noise (warnings, site hooks) before the first reply.
                Ok(Incoming::Raw(text) | Incoming::Reply(Ok(DriverReply::Stderr { text }))) => {
                    tracing::debug!(line = %text, "Driver startup output");
                }
                Ok(Incoming::Reply(Ok(other))) => {
                    return Err(InterpreterError::Launch(format!(
                        "unexpected handshake reply: {:?}",
                        other
                    )))
                }
                Ok(Incoming::Reply(Err(info))) => {
                    return Err(InterpreterError::Launch(info.message))
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(InterpreterError::Launch(format!(
                        "driver did not answer within {}s",
                        LAUNCH_TIMEOUT.as_secs()
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let status = self.reap();
                    return Err(InterpreterError::Launch(format!(
                        "driver exited during startup ({})",
                        status
                    )));
                }
            }
        }
    }

    fn send(&mut self, command: &DriverCommand) -> Result<(), InterpreterError> {
        let line = command
            .to_line()
            .map_err(|err| InterpreterError::Malformed(err.to_string()))?;
        tracing::debug!(command = command.name(), bytes = line.len(), "Driver command");
        let written = self
            .stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.flush());
        match written {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                Err(InterpreterError::Exited {
                    status: self.reap(),
                })
            }
            Err(err) => Err(InterpreterError::Io(err)),
        }
    }

    /// Sends one command and waits for its terminal reply, forwarding output
    /// replies on the way. With `interrupt`, the flag is checked after every
    /// reply and at least every `interrupt_poll`. With `fence`, the terminal
    /// reply is returned only after that line was read from raw stderr.
    fn request(
        &mut self,
        command: DriverCommand,
        fence: Option<&str>,
        interrupt: Option<&InterruptFlag>,
        output: &mut dyn FnMut(OutputChunk),
    ) -> Result<DriverReply, InterpreterError> {
        self.send(&command)?;
        let mut signalled_at: Option<Instant> = None;
        let mut fence_seen = fence.is_none();
        let mut held: Option<(DriverReply, Instant)> = None;

        loop {
            let wait = match &held {
                Some((_, deadline)) => deadline.saturating_duration_since(Instant::now()),
                None => self.interrupt_poll,
            };
            match self.replies.recv_timeout(wait) {
                Ok(Incoming::Raw(text)) => {
                    let (before, marker) = split_fence(&self.fence_prefix, &text);
                    if marker.is_none() || !before.is_empty() {
                        output(OutputChunk::stderr(before));
                    }
                    match marker {
                        Some(marker) if Some(marker) == fence => {
                            fence_seen = true;
                            if let Some((reply, _)) = held.take() {
                                return Ok(reply);
                            }
                        }
                        Some(marker) => tracing::debug!(marker, "Dropping stale output fence"),
                        None => {}
                    }
                }
                Ok(Incoming::Reply(Ok(DriverReply::Stdout { text }))) => {
                    output(OutputChunk::stdout(text))
                }
                Ok(Incoming::Reply(Ok(DriverReply::Stderr { text }))) => {
                    output(OutputChunk::stderr(text))
                }
                Ok(Incoming::Reply(Ok(DriverReply::Invalid { error }))) => {
                    return Err(InterpreterError::Malformed(error))
                }
                Ok(Incoming::Reply(Ok(DriverReply::Interrupted { command }))) => {
                    return Err(InterpreterError::Interrupted { command })
                }
                Ok(Incoming::Reply(Ok(reply))) => {
                    if fence_seen {
                        return Ok(reply);
                    }
                    held = Some((reply, Instant::now() + FENCE_WAIT));
                }
                Ok(Incoming::Reply(Err(info))) => {
                    return Err(InterpreterError::Malformed(info.message))
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some((reply, deadline)) = held.take() {
                        if Instant::now() >= deadline {
                            tracing::warn!(
                                command = command.name(),
                                "Output fence never arrived; releasing reply"
                            );
                            return Ok(reply);
                        }
                        held = Some((reply, deadline));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(InterpreterError::Exited {
                        status: self.reap(),
                    })
                }
            }

            // The run is over once its terminal reply is in.
            if held.is_some() {
                continue;
            }
            let Some(flag) = interrupt else {
                continue;
            };
            if !flag.is_requested() {
                continue;
            }
            match signalled_at {
                None => {
                    self.signal_interrupt();
                    signalled_at = Some(Instant::now());
                }
                Some(at) => {
                    if let Some(escalation) = self.escalation {
                        if at.elapsed() >= escalation {
                            tracing::warn!(
                                pid = self.child.id(),
                                command = command.name(),
                                waited_ms = escalation.as_millis() as u64,
                                "Driver ignored interrupt; killing it"
                            );
                            let status = self.reap();
                            return Err(InterpreterError::Exited {
                                status: format!("killed after ignoring interrupt ({})", status),
                            });
                        }
                    }
                }
            }
        }
    }

    fn next_fence(&mut self) -> String {
        self.fences += 1;
        format!("{}{}", self.fence_prefix, self.fences)
    }

    #[cfg(unix)]
    fn signal_interrupt(&mut self) {
        let pid = self.child.id() as libc::pid_t;
        // SAFETY: libc::kill with SIGINT is a standard POSIX signal delivery to
        // our own child. If it already exited we get ESRCH, and the closed
        // reply stream reports that on the next receive.
        #[allow(unsafe_code)]
        let rc = unsafe { libc::kill(pid, libc::SIGINT) };
        if rc == 0 {
            tracing::debug!(pid, "Sent SIGINT to driver");
        } else {
            tracing::debug!(pid, error = %std::io::Error::last_os_error(), "SIGINT delivery failed");
        }
    }

    #[cfg(not(unix))]
    fn signal_interrupt(&mut self) {
        tracing::debug!("No SIGINT on this platform; killing driver");
        let _ = self.child.kill();
    }

    /// Kills the driver if still alive and returns its exit status as text.
    fn reap(&mut self) -> String {
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => status.to_string(),
            Err(err) => format!("status unavailable: {}", err),
        }
    }
}

impl Interpreter for PythonInterpreter {
    fn install(
        &mut self,
        requirements: &[String],
        interrupt: &InterruptFlag,
        output: &mut dyn FnMut(OutputChunk),
    ) -> Result<InstallReport, InterpreterError> {
        if requirements.is_empty() {
            return Ok(InstallReport::default());
        }
        let command = DriverCommand::Install {
            requirements: requirements.to_vec(),
        };
        match self.request(command, None, Some(interrupt), output)? {
            DriverReply::Installed { installed, failed } => Ok(InstallReport { installed, failed }),
            other => Err(unexpected("install", &other)),
        }
    }

    fn evict_modules(&mut self, prefix: &Path) -> Result<usize, InterpreterError> {
        let command = DriverCommand::Evict {
            prefix: prefix.display().to_string(),
        };
        let mut discard = |chunk: OutputChunk| {
            tracing::debug!(text = %chunk.text, "Output during module eviction");
        };
        match self.request(command, None, None, &mut discard)? {
            DriverReply::Evicted { count } => Ok(count),
            other => Err(unexpected("evict", &other)),
        }
    }

    fn execute(
        &mut self,
        request: ExecRequest<'_>,
        interrupt: &InterruptFlag,
        output: &mut dyn FnMut(OutputChunk),
    ) -> Result<Outcome, InterpreterError> {
        let fence = self.next_fence();
        let command = DriverCommand::Exec {
            source: request.source.to_string(),
            filename: request.filename.map(str::to_string),
            cwd: request.cwd.display().to_string(),
            fence: Some(fence.clone()),
        };
        match self.request(command, Some(&fence), Some(interrupt), output)? {
            DriverReply::Done {
                interrupted: true,
                error,
                ..
            } => Ok(Outcome::Interrupted {
                traceback: error.unwrap_or_else(|| "KeyboardInterrupt".to_string()),
            }),
            DriverReply::Done {
                error: Some(traceback),
                ..
            } => Ok(Outcome::Raised { traceback }),
            DriverReply::Done { value, .. } => Ok(Outcome::Completed { value }),
            other => Err(unexpected("exec", &other)),
        }
    }
}

impl Drop for PythonInterpreter {
    fn drop(&mut self) {
        let status = self.reap();
        tracing::debug!(%status, "Python driver stopped");
    }
}

fn unexpected(command: &str, reply: &DriverReply) -> InterpreterError {
    InterpreterError::Malformed(format!("unexpected reply to {}: {:?}", command, reply))
}

fn spawn_reply_reader(
    stdout: std::process::ChildStdout,
    tx: Sender<Incoming>,
) -> Result<(), InterpreterError> {
    thread::Builder::new()
        .name("pyrun-driver-replies".to_string())
        .spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let parsed = match line {
                    Ok(line) => parse_reply(&line),
                    Err(err) => {
                        tracing::debug!(error = %err, "Driver reply stream closed");
                        break;
                    }
                };
                let fatal = parsed.is_err();
                if tx.send(Incoming::Reply(parsed)).is_err() || fatal {
                    break;
                }
            }
        })?;
    Ok(())
}

/// Process-level stderr (native extensions, child processes writing to the
/// raw descriptors) reaches the script's stderr stream too. The pipe is
/// drained until the driver exits, whatever bytes come through it; a full
/// pipe would block every later raw write.
fn spawn_stderr_forwarder(
    stderr: std::process::ChildStderr,
    tx: Sender<Incoming>,
) -> Result<(), InterpreterError> {
    thread::Builder::new()
        .name("pyrun-driver-stderr".to_string())
        .spawn(move || {
            let mut reader = BufReader::new(stderr);
            let mut line = Vec::new();
            let mut forwarding = true;
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::debug!(error = %err, "Driver stderr closed");
                        break;
                    }
                }
                if !forwarding {
                    continue;
                }
                let text = String::from_utf8_lossy(trim_line_end(&line)).into_owned();
                tracing::debug!(target: "pyrun::driver", line = %text);
                forwarding = tx.send(Incoming::Raw(text)).is_ok();
            }
        })?;
    Ok(())
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Splits a raw stderr line at a fence marker, if it carries one. Output
/// without a trailing newline ends up in front of the marker.
fn split_fence<'a>(prefix: &str, text: &'a str) -> (&'a str, Option<&'a str>) {
    match text.find(prefix) {
        Some(index) => (&text[..index], Some(&text[index..])),
        None => (text, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_is_split_from_unterminated_output() {
        let prefix = "\u{1}pyrun-fence:abc:";
        assert_eq!(
            split_fence(prefix, "partial\u{1}pyrun-fence:abc:3"),
            ("partial", Some("\u{1}pyrun-fence:abc:3"))
        );
        assert_eq!(
            split_fence(prefix, "\u{1}pyrun-fence:abc:3"),
            ("", Some("\u{1}pyrun-fence:abc:3"))
        );
        assert_eq!(split_fence(prefix, "plain"), ("plain", None));
    }

    #[test]
    fn line_endings_are_trimmed_bytewise() {
        assert_eq!(trim_line_end(b"abc\r\n"), b"abc");
        assert_eq!(trim_line_end(b"\xff\n"), b"\xff");
        assert_eq!(trim_line_end(b"tail"), b"tail");
    }
}
