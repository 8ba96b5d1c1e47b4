//! Thin async-runtime glue shared by the cluster, connection pool, discovery repeater, and
//! session pool actors. Every long-lived subsystem in this crate is a single `tokio` task that
//! owns its mutable state and is reachable only through message-passing handles; these helpers
//! are the common plumbing those actors are built from.

mod join_handle;

use std::{future::Future, time::Duration};

pub(crate) use self::join_handle::AsyncJoinHandle;
use crate::error::{ErrorKind, Result};

/// Spawn a task in the background to run a future.
///
/// Must be called from within a context running on a `tokio` runtime.
#[track_caller]
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::spawn(fut)
}

/// Await a future for at most `duration`, surfacing a [`ErrorKind::DeadlineExceeded`] if it does
/// not resolve in time.
pub(crate) async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ErrorKind::DeadlineExceeded.into())
}

/// As [`timeout`], but only applies the bound when `duration` is `Some`.
pub(crate) async fn maybe_timeout<F: Future>(
    duration: Option<Duration>,
    future: F,
) -> Result<F::Output> {
    match duration {
        Some(d) => timeout(d, future).await,
        None => Ok(future.await),
    }
}

/// A caller-supplied cancellation signal, playing the role the original driver's `ctx
/// context.Context` plays at every suspension point (`Cluster::get`, the session pool wait
/// queue, the balancer's `need_refresh`). Built on `watch` rather than pulling in the rest of
/// `tokio-util` for a single type: every other one-shot broadcast signal in this crate
/// ([`crate::balancer::RefreshSubscriber`]) is already shaped this way.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    sender: std::sync::Arc<tokio::sync::watch::Sender<bool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// A token that is never cancelled.
    pub fn new() -> Self {
        let (sender, _receiver) = tokio::sync::watch::channel(false);
        Self {
            sender: std::sync::Arc::new(sender),
        }
    }

    /// Cancel this token and every clone of it. Idempotent.
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }

    /// Whether [`CancellationToken::cancel`] has already been called.
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once [`CancellationToken::cancel`] has been called; resolves immediately if it
    /// already has been.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        loop {
            if *receiver.borrow() {
                return;
            }
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
