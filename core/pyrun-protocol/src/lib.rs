//! Message types for pyrun execution sessions.
//!
//! This crate is shared by the controller side of a session, the execution
//! thread that hosts the interpreter, and the interpreter driver process, so
//! that all three agree on one schema.
//!
//! Two layers live here:
//!
//! - [`Request`] / [`Event`]: the session protocol. Every request carries a
//!   [`CorrelationId`]; every terminal event echoes it. Output events carry no
//!   id because they are session-scoped broadcasts.
//! - [`DriverCommand`] / [`DriverReply`]: the newline-delimited JSON spoken
//!   between the execution thread and the interpreter driver.

use serde::{Deserialize, Serialize};

/// Largest correlation id before wrapping back to zero (2^53 - 1).
pub const MAX_CORRELATION_ID: u64 = 9_007_199_254_740_991;

/// Upper bound on one driver line. Anything larger is treated as malformed.
pub const MAX_DRIVER_LINE_BYTES: usize = 16 * 1024 * 1024;

pub type CorrelationId = u64;

/// Returns the id that follows `current`, wrapping at [`MAX_CORRELATION_ID`].
pub fn next_correlation_id(current: CorrelationId) -> CorrelationId {
    (current + 1) % MAX_CORRELATION_ID
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session protocol
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Init,
    Run,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Request {
    Init {
        id: CorrelationId,
    },
    Run {
        id: CorrelationId,
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
}

impl Request {
    pub fn id(&self) -> CorrelationId {
        match self {
            Request::Init { id } | Request::Run { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Init { .. } => RequestKind::Init,
            Request::Run { .. } => RequestKind::Run,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Event {
    Stdout {
        stdout: String,
    },
    Stderr {
        stderr: String,
    },
    Finished {
        id: CorrelationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        id: CorrelationId,
        error: ErrorInfo,
    },
}

impl Event {
    pub fn finished(id: CorrelationId) -> Self {
        Event::Finished {
            id,
            result: None,
            error: None,
        }
    }

    pub fn error(id: CorrelationId, code: &str, message: impl Into<String>) -> Self {
        Event::Error {
            id,
            error: ErrorInfo::new(code, message),
        }
    }

    /// The correlation id of a terminal event, `None` for output events.
    pub fn terminal_id(&self) -> Option<CorrelationId> {
        match self {
            Event::Finished { id, .. } | Event::Error { id, .. } => Some(*id),
            Event::Stdout { .. } | Event::Stderr { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_id().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Error codes carried by [`Event::Error`].
pub mod codes {
    pub const INTERRUPTED: &str = "interrupted";
    pub const LAUNCH_FAILED: &str = "launch_failed";
    pub const MOUNT_FAILED: &str = "mount_failed";
    pub const INTERPRETER_EXITED: &str = "interpreter_exited";
    pub const MALFORMED_MESSAGE: &str = "malformed_message";
    pub const NOT_INITIALIZED: &str = "not_initialized";
}

// ═══════════════════════════════════════════════════════════════════════════════
// Driver protocol
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum DriverCommand {
    Ping,
    Install {
        requirements: Vec<String>,
    },
    Evict {
        prefix: String,
    },
    Exec {
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        cwd: String,
        /// Line the driver writes to its raw stderr once the script's output
        /// is flushed, before `done`. Everything the process wrote to fd 1/2
        /// during the run precedes it on that pipe.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fence: Option<String>,
    },
}

impl DriverCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DriverCommand::Ping => "ping",
            DriverCommand::Install { .. } => "install",
            DriverCommand::Evict { .. } => "evict",
            DriverCommand::Exec { .. } => "exec",
        }
    }

    /// Encodes the command as one protocol line, newline included.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverReply {
    Ready {
        version: String,
    },
    Stdout {
        text: String,
    },
    Stderr {
        text: String,
    },
    Installed {
        #[serde(default)]
        installed: Vec<String>,
        #[serde(default)]
        failed: Vec<String>,
    },
    Evicted {
        count: usize,
    },
    Done {
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        interrupted: bool,
    },
    Interrupted {
        command: String,
    },
    Invalid {
        error: String,
    },
}

/// Parses one driver line, enforcing the size bound.
pub fn parse_reply(line: &str) -> Result<DriverReply, ErrorInfo> {
    if line.len() > MAX_DRIVER_LINE_BYTES {
        return Err(ErrorInfo::new(
            codes::MALFORMED_MESSAGE,
            format!(
                "driver line of {} bytes exceeds the {} byte limit",
                line.len(),
                MAX_DRIVER_LINE_BYTES
            ),
        ));
    }
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return Err(ErrorInfo::new(
            codes::MALFORMED_MESSAGE,
            "driver sent an empty line",
        ));
    }
    serde_json::from_str(trimmed).map_err(|err| {
        ErrorInfo::new(
            codes::MALFORMED_MESSAGE,
            format!("driver reply was not valid JSON: {}", err),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn correlation_ids_wrap_at_bound() {
        assert_eq!(next_correlation_id(0), 1);
        assert_eq!(next_correlation_id(41), 42);
        assert_eq!(next_correlation_id(MAX_CORRELATION_ID - 1), 0);
    }

    #[test]
    fn run_request_uses_kind_tag() {
        let request = Request::Run {
            id: 7,
            script: "print(1)".to_string(),
            filename: Some("a.py".to_string()),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"kind": "run", "id": 7, "script": "print(1)", "filename": "a.py"})
        );
        assert_eq!(request.kind(), RequestKind::Run);
        assert_eq!(request.id(), 7);
    }

    #[test]
    fn run_request_without_filename_omits_field() {
        let request = Request::Run {
            id: 1,
            script: "x".to_string(),
            filename: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("filename").is_none());
    }

    #[test]
    fn rejects_unknown_request_fields() {
        let parsed: Result<Request, _> =
            serde_json::from_value(json!({"kind": "init", "id": 1, "buffer": 3}));
        assert!(parsed.is_err());
    }

    #[test]
    fn output_events_have_no_terminal_id() {
        let stdout = Event::Stdout {
            stdout: "1".to_string(),
        };
        assert_eq!(stdout.terminal_id(), None);
        assert!(!stdout.is_terminal());
        assert_eq!(Event::finished(3).terminal_id(), Some(3));
        assert_eq!(
            Event::error(4, codes::INTERRUPTED, "KeyboardInterrupt").terminal_id(),
            Some(4)
        );
    }

    #[test]
    fn error_event_serializes_code_and_message() {
        let event = Event::error(9, codes::MOUNT_FAILED, "permission denied");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "kind": "error",
                "id": 9,
                "error": {"code": "mount_failed", "message": "permission denied"}
            })
        );
    }

    #[test]
    fn driver_command_line_is_newline_terminated() {
        let line = DriverCommand::Evict {
            prefix: "/tmp/project".to_string(),
        }
        .to_line()
        .unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains("\"kind\":\"evict\""));
    }

    #[test]
    fn exec_command_carries_fence_only_when_set() {
        let mut command = DriverCommand::Exec {
            source: "print(1)".to_string(),
            filename: None,
            cwd: "/tmp/mnt".to_string(),
            fence: None,
        };
        assert!(!command.to_line().unwrap().contains("fence"));

        if let DriverCommand::Exec { fence, .. } = &mut command {
            *fence = Some("\u{1}fence:1".to_string());
        }
        let value: serde_json::Value =
            serde_json::from_str(command.to_line().unwrap().trim_end()).unwrap();
        assert_eq!(value["fence"], json!("\u{1}fence:1"));
    }

    #[test]
    fn parses_done_reply_with_defaults() {
        let reply = parse_reply("{\"kind\":\"done\"}\n").unwrap();
        assert_eq!(
            reply,
            DriverReply::Done {
                value: None,
                error: None,
                interrupted: false
            }
        );
    }

    #[test]
    fn parses_interrupted_done_reply() {
        let reply = parse_reply(
            r#"{"kind":"done","error":"KeyboardInterrupt","interrupted":true}"#,
        )
        .unwrap();
        match reply {
            DriverReply::Done {
                interrupted, error, ..
            } => {
                assert!(interrupted);
                assert_eq!(error.as_deref(), Some("KeyboardInterrupt"));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn rejects_garbage_reply() {
        let err = parse_reply("not json").unwrap_err();
        assert_eq!(err.code, codes::MALFORMED_MESSAGE);
    }

    #[test]
    fn rejects_empty_reply() {
        assert!(parse_reply("  \n").is_err());
    }
}
