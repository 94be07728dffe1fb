//! App state and its transitions.
//!
//! State only changes through [`next_state`]; the controller renders after
//! every transition. [`controls`] derives which commands are available.

use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledText {
    pub text: String,
    pub kind: TextKind,
}

impl StyledText {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: TextKind::Success,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: TextKind::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppState {
    pub running: bool,
    pub project_root: Option<PathBuf>,
    pub project_name: Option<String>,
    pub entry_point: Option<PathBuf>,
    pub entry_label: Option<StyledText>,
    /// Fatal condition; every control is disabled while set.
    pub app_error: Option<String>,
    pub checking: bool,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            running: false,
            project_root: None,
            project_name: None,
            entry_point: None,
            entry_label: None,
            app_error: None,
            checking: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    ProjectSelected { root: PathBuf, name: String },
    EntrySelected { path: PathBuf, label: String },
    EntryRejected { message: String },
    RunStarted,
    RunEnded,
    CheckingToggled(bool),
    Failed(String),
}

pub fn next_state(state: &AppState, event: AppEvent) -> AppState {
    let mut next = state.clone();
    match event {
        AppEvent::ProjectSelected { root, name } => {
            next.project_root = Some(root);
            next.project_name = Some(name);
            // A new project invalidates the entry point.
            next.entry_point = None;
            next.entry_label = None;
        }
        AppEvent::EntrySelected { path, label } => {
            next.entry_point = Some(path);
            next.entry_label = Some(StyledText::success(label));
        }
        AppEvent::EntryRejected { message } => {
            next.entry_point = None;
            next.entry_label = Some(StyledText::error(message));
        }
        AppEvent::RunStarted => next.running = true,
        AppEvent::RunEnded => next.running = false,
        AppEvent::CheckingToggled(checking) => next.checking = checking,
        AppEvent::Failed(message) => next.app_error = Some(message),
    }
    next
}

/// Which commands are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    pub select_project: bool,
    pub select_entry: bool,
    pub run: bool,
    pub stop: bool,
    pub clear: bool,
}

pub fn controls(state: &AppState) -> Controls {
    if state.app_error.is_some() {
        return Controls {
            select_project: false,
            select_entry: false,
            run: false,
            stop: false,
            clear: false,
        };
    }
    if state.running {
        return Controls {
            select_project: false,
            select_entry: false,
            run: false,
            stop: true,
            clear: true,
        };
    }
    Controls {
        select_project: true,
        select_entry: state.project_root.is_some(),
        run: state.project_root.is_some() && state.entry_point.is_some(),
        stop: false,
        clear: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_project() -> AppState {
        next_state(
            &AppState::default(),
            AppEvent::ProjectSelected {
                root: PathBuf::from("/work/demo"),
                name: "demo".to_string(),
            },
        )
    }

    #[test]
    fn initial_state_only_allows_project_selection() {
        let state = AppState::default();
        assert_eq!(
            controls(&state),
            Controls {
                select_project: true,
                select_entry: false,
                run: false,
                stop: false,
                clear: true,
            }
        );
    }

    #[test]
    fn run_needs_project_and_entry() {
        let state = with_project();
        assert!(controls(&state).select_entry);
        assert!(!controls(&state).run);

        let state = next_state(
            &state,
            AppEvent::EntrySelected {
                path: PathBuf::from("/work/demo/main.py"),
                label: "main.py".to_string(),
            },
        );
        assert!(controls(&state).run);
        assert_eq!(state.entry_label, Some(StyledText::success("main.py")));
    }

    #[test]
    fn running_only_allows_stop_and_clear() {
        let state = next_state(&with_project(), AppEvent::RunStarted);
        let controls = controls(&state);
        assert!(controls.stop);
        assert!(controls.clear);
        assert!(!controls.run && !controls.select_project && !controls.select_entry);

        let state = next_state(&state, AppEvent::RunEnded);
        assert!(!state.running);
    }

    #[test]
    fn changing_project_clears_entry() {
        let state = next_state(
            &with_project(),
            AppEvent::EntrySelected {
                path: PathBuf::from("/work/demo/main.py"),
                label: "main.py".to_string(),
            },
        );
        let state = next_state(
            &state,
            AppEvent::ProjectSelected {
                root: PathBuf::from("/work/other"),
                name: "other".to_string(),
            },
        );
        assert_eq!(state.entry_point, None);
        assert_eq!(state.entry_label, None);
    }

    #[test]
    fn rejected_entry_shows_error_label() {
        let state = next_state(
            &with_project(),
            AppEvent::EntryRejected {
                message: "Entry point provided not in project directory.".to_string(),
            },
        );
        assert_eq!(state.entry_label.as_ref().map(|l| l.kind), Some(TextKind::Error));
        assert!(!controls(&state).run);
    }

    #[test]
    fn app_error_disables_everything() {
        let state = next_state(&with_project(), AppEvent::Failed("denied".to_string()));
        let controls = controls(&state);
        assert!(!controls.select_project && !controls.clear && !controls.run);
    }

    #[test]
    fn transitions_do_not_mutate_input() {
        let state = AppState::default();
        let _ = next_state(&state, AppEvent::RunStarted);
        assert!(!state.running);
    }
}
