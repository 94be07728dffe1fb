//! Terminal front end: script output, app state and type-check reports.

use chrono::Local;
use pyrun_core::{AppState, OutputSink, Renderer, TextKind, TypeCheckReport};
use std::io::Write;

/// Writes script output straight to the process streams.
#[derive(Debug, Default)]
pub struct TerminalSink;

impl OutputSink for TerminalSink {
    fn stdout(&mut self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", text);
        let _ = out.flush();
    }

    fn stderr(&mut self, text: &str) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", text);
    }
}

/// Prints the parts of the app state a terminal user cares about, once per
/// change.
#[derive(Debug, Default)]
pub struct TerminalRenderer {
    last: Option<AppState>,
}

impl Renderer for TerminalRenderer {
    fn render(&mut self, state: &AppState) {
        let previous = self.last.replace(state.clone());
        let previous = previous.unwrap_or_default();

        if state.app_error != previous.app_error {
            if let Some(error) = &state.app_error {
                eprintln!("pyrun: {}", error);
            }
        }
        if state.project_name != previous.project_name {
            if let Some(name) = &state.project_name {
                eprintln!("pyrun: project {}", name);
            }
        }
        if state.entry_label != previous.entry_label {
            if let Some(label) = &state.entry_label {
                match label.kind {
                    TextKind::Success => eprintln!("pyrun: entry {}", label.text),
                    TextKind::Error => eprintln!("pyrun: {}", label.text),
                }
            }
        }
        if state.running && !previous.running {
            tracing::debug!("Run started");
        }
    }
}

pub fn report_header() -> String {
    format!("[mypy report @ {}]", Local::now().format("%H:%M:%S"))
}

pub fn print_report(report: &TypeCheckReport) {
    println!("{}", report_header());
    if !report.error_text.is_empty() {
        println!("{}", report.error_text);
    }
    if !report.info_text.is_empty() {
        println!("{}", report.info_text);
    }
    println!();
}
