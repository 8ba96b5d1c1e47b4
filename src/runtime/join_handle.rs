use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::error::{ErrorKind, Result};

/// A wrapper around `tokio::task::JoinHandle` that converts join errors (panics, cancellation)
/// into this crate's own [`crate::error::Error`] type instead of leaking `tokio`'s.
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T>(tokio::task::JoinHandle<T>);

impl<T: Send + 'static> AsyncJoinHandle<T> {
    #[track_caller]
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self(tokio::task::spawn(fut))
    }

    /// Abort the underlying task. Used by background sweeps (idle-channel sweep, discovery
    /// repeater) that have no natural end and must be stopped explicitly on `close` rather than
    /// relying on drop, which would otherwise leak the task.
    pub(crate) fn abort(&self) {
        self.0.abort();
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| {
            result.map_err(|e| {
                ErrorKind::Internal {
                    message: format!("background task failed: {e}"),
                }
                .into()
            })
        })
    }
}
