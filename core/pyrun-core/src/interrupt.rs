//! The interrupt channel: one shared byte between a controller and its
//! execution thread.
//!
//! The controller writes [`REQUEST_INTERRUPT`] when the user asks to stop; the
//! execution thread reads it at cooperative checkpoints. No message is sent,
//! because a busy execution thread is not reading messages.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub const RUNNING: u8 = 0;
pub const REQUEST_INTERRUPT: u8 = 2;

#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    byte: Arc<AtomicU8>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self {
            byte: Arc::new(AtomicU8::new(RUNNING)),
        }
    }

    /// Called by the controller at the start of every run.
    pub fn reset(&self) {
        self.byte.store(RUNNING, Ordering::SeqCst);
    }

    pub fn request(&self) {
        self.byte.store(REQUEST_INTERRUPT, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.byte.load(Ordering::SeqCst) == REQUEST_INTERRUPT
    }

    pub fn value(&self) -> u8 {
        self.byte.load(Ordering::SeqCst)
    }
}

/// Cross-thread handle for stopping a session that another thread is blocked
/// inside `run` on. Fire-and-forget: there is no acknowledgement.
#[derive(Debug, Clone)]
pub struct StopHandle {
    flag: InterruptFlag,
}

impl StopHandle {
    pub(crate) fn new(flag: InterruptFlag) -> Self {
        Self { flag }
    }

    pub fn stop(&self) {
        tracing::debug!("Interrupt requested");
        self.flag.request();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flag.is_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn starts_running() {
        let flag = InterruptFlag::new();
        assert_eq!(flag.value(), RUNNING);
        assert!(!flag.is_requested());
    }

    #[test]
    fn request_then_reset() {
        let flag = InterruptFlag::new();
        flag.request();
        assert_eq!(flag.value(), REQUEST_INTERRUPT);
        flag.reset();
        assert_eq!(flag.value(), RUNNING);
    }

    #[test]
    fn clones_share_the_byte() {
        let controller = InterruptFlag::new();
        let worker = controller.clone();
        controller.request();
        assert!(worker.is_requested());
    }

    #[test]
    fn stop_handle_is_visible_across_threads() {
        let flag = InterruptFlag::new();
        let handle = StopHandle::new(flag.clone());
        thread::spawn(move || handle.stop()).join().unwrap();
        assert!(flag.is_requested());
    }
}
