//! Tracer hooks surfaced at every boundary named by the external-interfaces contract: Dial,
//! GetConn, Pessimize, Discovery, Operation, Stream, Cluster (Init/Get/Insert/Remove/Close), and
//! Session Pool (Create/Get/Wait/Put/Take/CloseSession).
//!
//! Hooks are stateless start/done pairs. A destination can be a plain callback, an async
//! callback, or a `tokio` channel sender -- the same three shapes the rest of this codebase
//! exposes for handler registration -- and is always available regardless of feature flags. When
//! the `tracing-unstable` feature is enabled, every emission additionally produces a `tracing`
//! event so operators get structured logs for free without registering a handler.

pub mod conn;
pub mod cluster;
pub mod session;

use std::sync::Arc;

use futures_util::future::BoxFuture;

/// A destination for events. Allows implicit conversion via [`From`] for concrete types for
/// convenience with [`crate::config::ClientConfig`] construction, or explicit construction for
/// `Fn` traits via [`EventHandler::callback`].
#[derive(Clone)]
#[non_exhaustive]
pub enum EventHandler<T> {
    /// A synchronous callback.
    Callback(Arc<dyn Fn(T) + Sync + Send>),
    /// An async callback, spawned onto the runtime rather than awaited inline.
    AsyncCallback(Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Sync + Send>),
    /// A `tokio` channel sender.
    TokioMpsc(tokio::sync::mpsc::Sender<T>),
}

impl<T> std::fmt::Debug for EventHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EventHandler").finish()
    }
}

impl<T> From<tokio::sync::mpsc::Sender<T>> for EventHandler<T> {
    fn from(value: tokio::sync::mpsc::Sender<T>) -> Self {
        Self::TokioMpsc(value)
    }
}

impl<T: Send + Sync + 'static> EventHandler<T> {
    /// Construct a new event handler from a synchronous callback.
    pub fn callback(f: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::Callback(Arc::new(f))
    }

    /// Construct a new event handler from an async callback.
    pub fn async_callback(f: impl Fn(T) -> BoxFuture<'static, ()> + Send + Sync + 'static) -> Self {
        Self::AsyncCallback(Arc::new(f))
    }

    pub(crate) fn handle(&self, event: T) {
        match self {
            Self::Callback(cb) => (cb)(event),
            Self::AsyncCallback(cb) => {
                crate::runtime::spawn((cb)(event));
            }
            Self::TokioMpsc(sender) => {
                let sender = sender.clone();
                crate::runtime::spawn(async move {
                    let _ = sender.send(event).await;
                });
            }
        }
    }
}

/// Composes an optional user-registered [`EventHandler`] with the crate's own `tracing`
/// emission. Every subsystem (`cluster`, `conn`, `balancer`, `session`) owns one of these per
/// event type it emits, the same way the rest of this codebase pairs a `CmapEventEmitter` with
/// each connection pool worker.
#[derive(Clone, Debug)]
pub struct Emitter<T> {
    handler: Option<EventHandler<T>>,
}

/// Hand-rolled rather than `#[derive(Default)]`: the derive macro would add a `T: Default` bound
/// to the generated impl even though `handler` defaults to `None` regardless of `T`, which would
/// make `Emitter<SomeEvent>` only `Default` for event types that themselves implement `Default` --
/// none of the event structs/enums in `event::conn`, `event::cluster`, or `event::session` do,
/// since they always carry at least an `Endpoint` or similar non-`Default` field.
impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self { handler: None }
    }
}

impl<T: Clone + Send + Sync + std::fmt::Debug + 'static> Emitter<T> {
    /// Construct an emitter with no registered handler; `tracing`-only emission (see
    /// [`Emitter::emit`]) still applies regardless.
    pub fn new(handler: Option<EventHandler<T>>) -> Self {
        Self { handler }
    }

    /// Evaluate `make_event` and dispatch it to the registered handler, if any, and -- when the
    /// `tracing-unstable` feature is enabled -- to the `tracing` crate as a debug-level event.
    /// The event is built lazily so that an emitter with no registered handler and no tracing
    /// subscriber installed never pays construction cost.
    pub(crate) fn emit(&self, make_event: impl FnOnce() -> T) {
        #[cfg(feature = "tracing-unstable")]
        {
            // `tracing` subscribers and bare `log` loggers are both legitimate consumers of this
            // crate's diagnostics (some deployments run a `log`-only logger with no `tracing`
            // subscriber installed), so either being enabled is reason enough to pay for the
            // event's construction.
            let enabled = tracing::event_enabled!(tracing::Level::DEBUG)
                || log::log_enabled!(log::Level::Debug);
            if self.handler.is_some() || enabled {
                let event = make_event();
                if let Some(handler) = &self.handler {
                    handler.handle(event.clone());
                }
                tracing::debug!(target: "fabricdb_core", ?event);
            }
        }
        #[cfg(not(feature = "tracing-unstable"))]
        {
            if let Some(handler) = &self.handler {
                handler.handle(make_event());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn emitter_without_handler_skips_construction() {
        let emitter: Emitter<u32> = Emitter::new(None);
        let built = Arc::new(Mutex::new(false));
        let built2 = built.clone();
        emitter.emit(move || {
            *built2.lock().unwrap() = true;
            0
        });
        assert!(!*built.lock().unwrap());
    }

    #[test]
    fn emitter_with_callback_dispatches() {
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let emitter = Emitter::new(Some(EventHandler::callback(move |v: u32| {
            *seen2.lock().unwrap() = Some(v);
        })));
        emitter.emit(|| 7);
        assert_eq!(*seen.lock().unwrap(), Some(7));
    }
}
