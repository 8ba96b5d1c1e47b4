//! Events emitted by the session pool: creation, get/wait/put/take, and session close.

use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum SessionCreateEvent {
    Started,
    Succeeded { session_id: String, duration: Duration },
    Failed { duration: Duration, error: String },
}

#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum SessionGetEvent {
    Started,
    /// The caller was served an idle session without touching the wait queue.
    HitIdle { session_id: String },
    /// The pool had capacity to create a new session to satisfy the request.
    Created { session_id: String },
    /// The caller had to wait for another caller's `Put`.
    Waited { session_id: String, wait_duration: Duration },
    Failed { duration: Duration, error: String },
}

#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct SessionPutEvent {
    pub session_id: String,
    /// `true` if the session was delivered directly to a waiter instead of the idle list.
    pub delivered_to_waiter: bool,
}

#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct SessionTakeEvent {
    pub session_id: String,
    pub succeeded: bool,
}

#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum SessionCloseEvent {
    /// The session was deleted because the keeper observed a bad-session error or aged it out.
    KeeperDeleted { session_id: String },
    /// The session was closed as part of `SessionPool::close`.
    PoolClosed { session_id: String },
}
