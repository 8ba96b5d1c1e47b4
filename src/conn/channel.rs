//! The Transport Channel: owns one physical connection to one endpoint and the state machine
//! around dialing, idle-TTL, and shutdown, grounded on the `dial`/idle-close lifecycle the
//! connection pool worker in this codebase applies to its own pooled streams.

use std::{sync::Arc, time::Duration};

use tokio::sync::Mutex;

use crate::{
    endpoint::Endpoint,
    error::{Error, ErrorKind, Result},
    event::{conn::DialCompletedEvent, Emitter},
    runtime,
    transport::{OperationParams, RawChannel, WireTransport},
};

/// Lifecycle state of a [`TransportChannel`]. `TransientFailure` is reachable from `Ready` or
/// `Connecting`; every other transition is driven by explicit calls (`dial`, `close`) or the
/// idle-TTL timer expiring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Created,
    Connecting,
    Ready,
    Idle,
    TransientFailure,
    Shutdown,
}

struct Inner {
    state: ChannelState,
    raw: Option<Box<dyn RawChannel>>,
    last_used: std::time::Instant,
}

/// One physical channel to one [`Endpoint`]. Safe under concurrent callers: `invoke` and
/// `open_stream` serialize dialing through the inner mutex so at most one dial attempt is ever
/// in flight, matching the Transport Channel contract's "at most one concurrent dial attempt"
/// invariant.
pub(crate) struct TransportChannel {
    endpoint: Endpoint,
    transport: Arc<dyn WireTransport>,
    dial_timeout: Duration,
    idle_ttl: Duration,
    inner: Mutex<Inner>,
    dial_events: Emitter<DialCompletedEvent>,
}

impl TransportChannel {
    pub(crate) fn new(
        endpoint: Endpoint,
        transport: Arc<dyn WireTransport>,
        dial_timeout: Duration,
        idle_ttl: Duration,
        dial_events: Emitter<DialCompletedEvent>,
    ) -> Self {
        Self {
            endpoint,
            transport,
            dial_timeout,
            idle_ttl,
            inner: Mutex::new(Inner {
                state: ChannelState::Created,
                raw: None,
                last_used: std::time::Instant::now(),
            }),
            dial_events,
        }
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) async fn state(&self) -> ChannelState {
        self.inner.lock().await.state
    }

    /// Close the physical channel, if any, and mark this transport channel permanently
    /// shut down. Subsequent operations fail with a transport error rather than re-dialing.
    pub(crate) async fn close(&self) {
        let mut guard = self.inner.lock().await;
        guard.raw = None;
        guard.state = ChannelState::Shutdown;
    }

    /// Ensure a usable raw channel is present, re-dialing if the channel was never dialed, went
    /// idle, or entered a transient-failure state. Returns an error if this channel has been
    /// explicitly shut down.
    async fn ensure_connected<'a>(
        &self,
        guard: &'a mut Inner,
    ) -> Result<&'a mut Box<dyn RawChannel>> {
        if guard.state == ChannelState::Shutdown {
            return Err(Error::transport(self.endpoint.clone(), "channel is shut down"));
        }

        let needs_dial = match &guard.raw {
            None => true,
            Some(raw) => !raw.is_usable(),
        };

        if needs_dial {
            guard.state = ChannelState::Connecting;
            let started = std::time::Instant::now();
            let result = runtime::timeout(self.dial_timeout, self.transport.dial(&self.endpoint, self.dial_timeout)).await;
            let dial_result = match result {
                Ok(inner) => inner,
                Err(e) => Err(e),
            };
            match dial_result {
                Ok(raw) => {
                    guard.raw = Some(raw);
                    guard.state = ChannelState::Ready;
                    self.dial_events.emit(|| DialCompletedEvent {
                        endpoint: self.endpoint.clone(),
                        duration: started.elapsed(),
                        error: None,
                    });
                }
                Err(e) => {
                    guard.state = ChannelState::TransientFailure;
                    self.dial_events.emit(|| DialCompletedEvent {
                        endpoint: self.endpoint.clone(),
                        duration: started.elapsed(),
                        error: Some(e.to_string()),
                    });
                    return Err(e);
                }
            }
        }

        guard.last_used = std::time::Instant::now();
        guard.state = ChannelState::Ready;
        Ok(guard.raw.as_mut().expect("just ensured Some"))
    }

    pub(crate) async fn invoke(
        &self,
        method: &str,
        request: &[u8],
        params: OperationParams,
    ) -> Result<Vec<u8>> {
        let mut guard = self.inner.lock().await;
        let raw = self.ensure_connected(&mut guard).await?;
        raw.invoke(method, request, params).await
    }

    pub(crate) async fn open_stream(
        &self,
        method: &str,
        request: &[u8],
    ) -> Result<Box<dyn crate::transport::RawStream>> {
        let mut guard = self.inner.lock().await;
        let raw = self.ensure_connected(&mut guard).await?;
        raw.open_stream(method, request).await
    }

    /// Whether this channel has sat idle (no `invoke`/`open_stream`) for at least `idle_ttl`. If
    /// so, the owning [`crate::conn::Connection`] closes the physical channel; the
    /// `TransportChannel` itself persists and will re-dial lazily on next use.
    pub(crate) async fn close_if_idle(&self) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.raw.is_none() || guard.state == ChannelState::Shutdown {
            return false;
        }
        if guard.last_used.elapsed() >= self.idle_ttl {
            guard.raw = None;
            guard.state = ChannelState::Idle;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportChannel")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
