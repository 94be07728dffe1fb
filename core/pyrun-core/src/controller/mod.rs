//! The UI boundary: commands in, state and output out.
//!
//! A [`Controller`] owns the app state, the runner session (through a
//! [`SessionRegistry`]) and, optionally, the background type-check scheduler.
//! Front ends implement [`Renderer`] and an [`OutputSink`]; they never touch
//! sessions directly.

mod transition;

pub use transition::{controls, next_state, AppEvent, AppState, Controls, StyledText, TextKind};

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{ControllerError, PyrunError, SessionError, StoreError};
use crate::interpreter::InterpreterBackend;
use crate::interrupt::StopHandle;
use crate::selection::{Selection, SelectionStore};
use crate::session::{ExecutionResult, ExecutionSession, OutputSink};
use crate::store::{FileStore, LocalStore};
use crate::typecheck::SchedulerHandle;

pub const ENTRY_OUTSIDE_PROJECT: &str = "Entry point provided not in project directory.";
pub const WRITE_ACCESS_DENIED: &str = "Write access to the project directory was denied.";

pub trait Renderer: Send {
    fn render(&mut self, state: &AppState);
}

impl<F> Renderer for F
where
    F: FnMut(&AppState) + Send,
{
    fn render(&mut self, state: &AppState) {
        self(state)
    }
}

/// Output sink shared between the controller and its sessions.
pub type SharedSink = Arc<Mutex<Box<dyn OutputSink>>>;

pub fn shared_sink(sink: impl OutputSink + 'static) -> SharedSink {
    Arc::new(Mutex::new(Box::new(sink)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Owns the runner session. Sessions are created lazily, initialised on
/// first use, and replaced after any fault or stop.
pub struct SessionRegistry {
    backend: Arc<dyn InterpreterBackend>,
    sink: SharedSink,
    requirements_file: String,
    store: Option<Arc<dyn FileStore>>,
    session: Option<ExecutionSession>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn InterpreterBackend>, sink: SharedSink) -> Self {
        Self {
            backend,
            sink,
            requirements_file: "requirements.txt".to_string(),
            store: None,
            session: None,
        }
    }

    pub fn with_requirements_file(mut self, name: impl Into<String>) -> Self {
        self.requirements_file = name.into();
        self
    }

    pub fn set_project(&mut self, store: Option<Arc<dyn FileStore>>) {
        self.discard();
        self.store = store;
    }

    pub fn current(&self) -> Option<&ExecutionSession> {
        self.session.as_ref()
    }

    pub fn discard(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::debug!(session = %session.id(), state = ?session.state(), "Discarding session");
        }
    }

    /// The current session, created and initialised if needed.
    pub fn session(&mut self) -> Result<&mut ExecutionSession, PyrunError> {
        let store = self.store.clone().ok_or(ControllerError::NoProject)?;
        if self.session.as_ref().is_some_and(|session| session.is_faulted()) {
            self.discard();
        }
        if self.session.is_none() {
            let mut session = ExecutionSession::new(
                Arc::clone(&self.backend),
                store,
                Box::new(Arc::clone(&self.sink)),
            )
            .with_requirements_file(self.requirements_file.clone());
            session.init()?;
            self.session = Some(session);
        }
        self.session
            .as_mut()
            .ok_or_else(|| SessionError::Transport("session unavailable".to_string()).into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Controller
// ═══════════════════════════════════════════════════════════════════════════════

/// Stops the current run from any thread. A no-op when nothing runs.
#[derive(Debug, Clone, Default)]
pub struct ControllerStop {
    slot: Arc<Mutex<Option<StopHandle>>>,
}

impl ControllerStop {
    pub fn stop(&self) -> bool {
        let Ok(slot) = self.slot.lock() else {
            return false;
        };
        match slot.as_ref() {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    fn arm(&self, handle: StopHandle) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(handle);
        }
    }

    fn disarm(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

pub struct Controller<R: Renderer> {
    state: AppState,
    renderer: R,
    registry: SessionRegistry,
    sink: SharedSink,
    store: Option<Arc<dyn FileStore>>,
    selection: Box<dyn SelectionStore>,
    scheduler: Option<SchedulerHandle>,
    stop: ControllerStop,
}

impl<R: Renderer> Controller<R> {
    pub fn new(
        backend: Arc<dyn InterpreterBackend>,
        sink: SharedSink,
        selection: Box<dyn SelectionStore>,
        renderer: R,
    ) -> Self {
        let mut controller = Self {
            state: AppState::default(),
            renderer,
            registry: SessionRegistry::new(backend, Arc::clone(&sink)),
            sink,
            store: None,
            selection,
            scheduler: None,
            stop: ControllerStop::default(),
        };
        controller.renderer.render(&controller.state);
        controller
    }

    pub fn with_requirements_file(mut self, name: impl Into<String>) -> Self {
        self.registry = self.registry.with_requirements_file(name);
        self
    }

    /// Hands the background checker to the controller, which keeps it pointed
    /// at the selected project and toggles it with `set_checking`.
    pub fn attach_scheduler(&mut self, scheduler: SchedulerHandle) {
        scheduler.set_project(self.store.clone());
        scheduler.set_active(self.state.checking);
        self.scheduler = Some(scheduler);
    }

    pub fn detach_scheduler(&mut self) -> Option<SchedulerHandle> {
        self.scheduler.take()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn controls(&self) -> Controls {
        controls(&self.state)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn store(&self) -> Option<&Arc<dyn FileStore>> {
        self.store.as_ref()
    }

    pub fn stop_handle(&self) -> ControllerStop {
        self.stop.clone()
    }

    fn apply(&mut self, event: AppEvent) {
        tracing::debug!(?event, "App event");
        self.state = next_state(&self.state, event);
        self.renderer.render(&self.state);
    }

    /// Re-applies the persisted selection. Entries that no longer resolve are
    /// dropped silently.
    pub fn restore(&mut self) -> Result<(), PyrunError> {
        let saved = self.selection.load()?;
        let Some(root) = saved.project_root else {
            return Ok(());
        };
        if let Err(err) = self.select_project(&root) {
            tracing::warn!(root = %root.display(), error = %err, "Saved project no longer usable");
            return Ok(());
        }
        if let Some(entry) = saved.entry_point {
            if let Err(err) = self.select_entry(&entry) {
                tracing::warn!(entry = %entry.display(), error = %err, "Saved entry point no longer usable");
            }
        }
        Ok(())
    }

    pub fn select_project(&mut self, root: &Path) -> Result<(), PyrunError> {
        let store = LocalStore::open(root)?;
        if let Err(err) = store.check_writable() {
            if matches!(err, StoreError::PermissionDenied(_)) {
                self.apply(AppEvent::Failed(WRITE_ACCESS_DENIED.to_string()));
            }
            return Err(err.into());
        }
        if self
            .store
            .as_ref()
            .is_some_and(|current| current.root() == store.root())
        {
            return Ok(());
        }

        let store: Arc<dyn FileStore> = Arc::new(store);
        tracing::info!(root = %store.root().display(), "Project selected");
        self.persist(Selection::new(Some(store.root().to_path_buf()), None));
        self.registry.set_project(Some(Arc::clone(&store)));
        if let Some(scheduler) = &self.scheduler {
            scheduler.set_project(Some(Arc::clone(&store)));
        }
        self.apply(AppEvent::ProjectSelected {
            root: store.root().to_path_buf(),
            name: store.name(),
        });
        self.store = Some(store);
        Ok(())
    }

    pub fn select_entry(&mut self, file: &Path) -> Result<(), PyrunError> {
        let store = self.store.clone().ok_or(ControllerError::NoProject)?;
        let Some(segments) = store.resolve_path(file) else {
            self.apply(AppEvent::EntryRejected {
                message: ENTRY_OUTSIDE_PROJECT.to_string(),
            });
            return Err(ControllerError::EntryOutsideProject.into());
        };
        let label = segments.join("/");
        let path = store.root().join(&label);
        self.persist(Selection::new(
            Some(store.root().to_path_buf()),
            Some(path.clone()),
        ));
        self.apply(AppEvent::EntrySelected { path, label });
        Ok(())
    }

    /// Runs the entry point to completion. A script exception is written to
    /// the output sink and returned in the result; any other failure discards
    /// the session.
    pub fn run(&mut self) -> Result<ExecutionResult, PyrunError> {
        if self.state.running {
            return Err(ControllerError::AlreadyRunning.into());
        }
        let store = self.store.clone().ok_or(ControllerError::NoProject)?;
        let label = match &self.state.entry_label {
            Some(label) if label.kind == TextKind::Success && self.state.entry_point.is_some() => {
                label.text.clone()
            }
            _ => return Err(ControllerError::NoEntryPoint.into()),
        };

        self.apply(AppEvent::RunStarted);
        let outcome = self.run_entry(store.as_ref(), &label);
        self.stop.disarm();

        let stopped = self
            .registry
            .current()
            .is_some_and(|session| session.interrupt_flag().is_requested());
        match &outcome {
            Ok(result) => {
                if let Some(error) = &result.error {
                    if !stopped {
                        self.write_stderr(error);
                    }
                }
            }
            Err(err) => {
                self.write_stderr(&err.to_string());
                tracing::warn!(error = %err, "Run failed; session discarded");
            }
        }
        if outcome.is_err() || stopped {
            self.registry.discard();
        }
        self.apply(AppEvent::RunEnded);
        outcome
    }

    fn run_entry(
        &mut self,
        store: &dyn FileStore,
        label: &str,
    ) -> Result<ExecutionResult, PyrunError> {
        let bytes = store.read(label)?;
        let script = String::from_utf8_lossy(&bytes).into_owned();
        let session = self.registry.session()?;
        self.stop.arm(session.stop_handle());
        Ok(session.run(&script, Some(label))?)
    }

    /// Stops the current run, if any.
    pub fn stop(&self) -> bool {
        self.stop.stop()
    }

    pub fn set_checking(&mut self, checking: bool) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.set_active(checking);
        }
        self.apply(AppEvent::CheckingToggled(checking));
    }

    fn write_stderr(&self, text: &str) {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stderr(text);
    }

    fn persist(&self, selection: Selection) {
        if let Err(err) = self.selection.save(&selection) {
            tracing::warn!(error = %err, "Could not persist selection");
        }
    }
}
