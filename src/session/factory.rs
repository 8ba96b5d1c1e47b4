//! The session-service RPC collaborator named in the external-interfaces contract (§6): create,
//! keepalive, and delete a server-side session over a given [`Connection`]. Implemented outside
//! this crate (e.g. by the table-service client built on top of it); the pool only calls these
//! three methods and treats the session id they hand back as opaque.

use async_trait::async_trait;

use crate::{conn::Connection, error::Result, session::Session};

/// Collaborator responsible for the session-service RPCs. Mirrors [`crate::cluster::DiscoveryClient`]:
/// a small, fallible, externally-implemented interface the pool drives but never implements
/// itself.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Create a new server-side session over `conn`. The returned [`Session`]'s id is whatever
    /// the server assigned; this crate never invents one.
    async fn create_session(&self, conn: &Connection) -> Result<Session>;

    /// Keep `session` alive. A [`crate::error::ErrorKind::BadSession`] here tells the pool the
    /// session is no longer usable and should be deleted rather than recycled.
    async fn keep_alive_session(&self, conn: &Connection, session: &Session) -> Result<()>;

    /// Delete `session` on the server. Called when the keeper ages a session out and when the
    /// pool is closed; best-effort from the pool's point of view (the pool proceeds regardless of
    /// the result).
    async fn delete_session(&self, conn: &Connection, session: &Session) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Mutex,
        },
    };

    use crate::error::ErrorKind;

    use super::*;

    /// A [`SessionFactory`] that never talks to a real server: `create_session` hands out
    /// incrementing ids and `keep_alive_session`/`delete_session` always succeed.
    #[derive(Debug, Default)]
    pub(crate) struct CountingSessionFactory {
        next_id: AtomicU64,
    }

    #[async_trait]
    impl SessionFactory for CountingSessionFactory {
        async fn create_session(&self, _conn: &Connection) -> Result<Session> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(Session::new(format!("session-{id}")))
        }

        async fn keep_alive_session(&self, _conn: &Connection, _session: &Session) -> Result<()> {
            Ok(())
        }

        async fn delete_session(&self, _conn: &Connection, _session: &Session) -> Result<()> {
            Ok(())
        }
    }

    /// A [`SessionFactory`] whose `keep_alive_session` fails with [`ErrorKind::BadSession`] on
    /// every session id named in `bad_session_ids`, and otherwise behaves like
    /// [`CountingSessionFactory`]. Used to exercise the keeper's delete-on-`BadSession` path.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedSessionFactory {
        next_id: AtomicU64,
        bad_session_ids: Mutex<HashSet<String>>,
        pub(crate) deleted: AtomicBool,
    }

    impl ScriptedSessionFactory {
        pub(crate) fn fail_keepalive_for(&self, session_id: impl Into<String>) {
            self.bad_session_ids.lock().unwrap().insert(session_id.into());
        }
    }

    #[async_trait]
    impl SessionFactory for ScriptedSessionFactory {
        async fn create_session(&self, _conn: &Connection) -> Result<Session> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(Session::new(format!("session-{id}")))
        }

        async fn keep_alive_session(&self, _conn: &Connection, session: &Session) -> Result<()> {
            if self.bad_session_ids.lock().unwrap().contains(session.id()) {
                return Err(ErrorKind::BadSession {
                    session_id: session.id().to_string(),
                    message: "scripted failure".to_string(),
                }
                .into());
            }
            Ok(())
        }

        async fn delete_session(&self, _conn: &Connection, _session: &Session) -> Result<()> {
            self.deleted.store(true, Ordering::SeqCst);
            Ok(())
        }
    }
}
