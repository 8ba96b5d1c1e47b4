//! Events emitted by the transport channel and connection layer: dial attempts, unary/streaming
//! invocation, and pessimization.

use std::time::Duration;

use crate::endpoint::Endpoint;

/// Emitted when a dial attempt completes, successfully or not. There is no paired "started"
/// event: the `GetConn` boundary this would otherwise straddle is already fully covered one layer
/// up by [`crate::event::cluster::ClusterGetEvent`], which carries its own duration.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct DialCompletedEvent {
    /// The endpoint that was dialed.
    pub endpoint: Endpoint,
    /// How long the dial took.
    pub duration: Duration,
    /// `None` on success; the failure message otherwise.
    pub error: Option<String>,
}

/// Emitted whenever a connection is pessimized (marked `Banned`).
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct PessimizedEvent {
    pub endpoint: Endpoint,
    /// Human-readable cause, e.g. the triggering error's `Display` output.
    pub cause: String,
}

/// Events emitted over the lifetime of a single outbound RPC (`Connection::invoke`).
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum OperationEvent {
    Started { endpoint: Endpoint, method: &'static str },
    Succeeded { endpoint: Endpoint, method: &'static str, duration: Duration },
    Failed { endpoint: Endpoint, method: &'static str, duration: Duration, error: String },
}

/// Events emitted over the lifetime of a server-streaming call (`Connection::new_stream`).
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum StreamEvent {
    Opened { endpoint: Endpoint, method: &'static str },
    MessageReceived { endpoint: Endpoint },
    Closed { endpoint: Endpoint, error: Option<String> },
}
