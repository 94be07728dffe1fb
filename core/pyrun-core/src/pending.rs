//! Pending call table keyed by correlation id.
//!
//! A call is registered when its request is sent and completed exactly once,
//! when the matching terminal event arrives. An id is never handed out again
//! while its call is still pending.

use pyrun_protocol::{next_correlation_id, CorrelationId, RequestKind};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::SessionError;

#[derive(Debug, Clone)]
pub struct PendingCall {
    pub id: CorrelationId,
    pub kind: RequestKind,
    issued_at: Instant,
}

impl PendingCall {
    pub fn elapsed(&self) -> Duration {
        self.issued_at.elapsed()
    }
}

#[derive(Debug, Default)]
pub struct PendingCalls {
    last_id: CorrelationId,
    calls: HashMap<CorrelationId, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn starting_after(last_id: CorrelationId) -> Self {
        Self {
            last_id,
            calls: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: RequestKind) -> CorrelationId {
        let mut id = next_correlation_id(self.last_id);
        while self.calls.contains_key(&id) {
            id = next_correlation_id(id);
        }
        self.last_id = id;
        self.calls.insert(
            id,
            PendingCall {
                id,
                kind,
                issued_at: Instant::now(),
            },
        );
        id
    }

    pub fn complete(&mut self, id: CorrelationId) -> Result<PendingCall, SessionError> {
        self.calls
            .remove(&id)
            .ok_or(SessionError::UnknownCorrelation(id))
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Drops every outstanding call, returning them for logging.
    pub fn abandon_all(&mut self) -> Vec<PendingCall> {
        self.calls.drain().map(|(_, call)| call).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyrun_protocol::MAX_CORRELATION_ID;

    #[test]
    fn ids_increase_monotonically() {
        let mut calls = PendingCalls::new();
        let first = calls.register(RequestKind::Init);
        let second = calls.register(RequestKind::Run);
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn completes_exactly_once() {
        let mut calls = PendingCalls::new();
        let id = calls.register(RequestKind::Run);
        let call = calls.complete(id).unwrap();
        assert_eq!(call.id, id);
        assert_eq!(call.kind, RequestKind::Run);
        assert!(matches!(
            calls.complete(id),
            Err(SessionError::UnknownCorrelation(other)) if other == id
        ));
        assert!(calls.is_empty());
    }

    #[test]
    fn unknown_id_is_rejected() {
        let mut calls = PendingCalls::new();
        assert!(calls.complete(99).is_err());
    }

    #[test]
    fn wraps_without_reusing_pending_ids() {
        let mut calls = PendingCalls::starting_after(MAX_CORRELATION_ID - 2);
        let near_end = calls.register(RequestKind::Run);
        assert_eq!(near_end, MAX_CORRELATION_ID - 1);
        let wrapped = calls.register(RequestKind::Run);
        assert_eq!(wrapped, 0);

        // Force the counter back around while 0 and 1 are still outstanding.
        calls.last_id = MAX_CORRELATION_ID - 1;
        let taken = calls.register(RequestKind::Run);
        assert_eq!(taken, 1);
        let next = calls.register(RequestKind::Run);
        assert_eq!(next, 2);
        assert!(calls.complete(0).is_ok());
    }

    #[test]
    fn abandon_all_clears_table() {
        let mut calls = PendingCalls::new();
        calls.register(RequestKind::Init);
        calls.register(RequestKind::Run);
        let dropped = calls.abandon_all();
        assert_eq!(dropped.len(), 2);
        assert!(calls.is_empty());
    }
}
