//! The [`Session`] value type: an opaque server-side handle identified by a string id, as
//! assigned by the (external) create-session RPC response. Per `SPEC_FULL.md` §9.1 this crate
//! never fabricates an id of its own.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

/// A server-side table-service session. Owned exclusively by [`super::pool::SessionPool`] while
/// idle; owned by the caller between [`super::pool::SessionPool::get`] and
/// [`super::pool::SessionPool::put`]. A session never migrates between pools.
pub struct Session {
    id: String,
    created_at: Instant,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Instant::now(),
            closed: AtomicBool::new(false),
        }
    }

    /// The server-assigned session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When this session was created, from this client's point of view.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Whether the pool has already closed this session (via the keeper aging it out, a bad
    /// session error, or [`super::pool::SessionPool::close`]).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_open() {
        let session = Session::new("session-1");
        assert_eq!(session.id(), "session-1");
        assert!(!session.is_closed());
    }

    #[test]
    fn mark_closed_is_observable() {
        let session = Session::new("session-1");
        session.mark_closed();
        assert!(session.is_closed());
    }
}
