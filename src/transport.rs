//! External collaborator interfaces consumed by the connection fabric: the wire transport, and
//! the credentials/metadata decorator. Neither is implemented by this crate; both are injected so
//! that the fabric never commits to a concrete wire protocol or auth mechanism.

use std::time::Duration;

use async_trait::async_trait;

use crate::{endpoint::Endpoint, error::Result};

/// Server-side timing hints for a single unary call: `OperationTimeout` and
/// `OperationCancelAfter`, independent of the whole-call `RequestTimeout` already applied as a
/// context deadline around the transport invocation itself. Since this crate's request payload is
/// an opaque `&[u8]` rather than a typed message with an operation-params slot, these are threaded
/// to the transport alongside the payload instead of being serialized into it; a concrete
/// `RawChannel` implementation is expected to fold them into whatever operation-params field its
/// wire format carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperationParams {
    /// Server-side bound on the operation itself, independent of `RequestTimeout`.
    pub operation_timeout: Option<Duration>,
    /// Bound after which the server should cancel (rather than merely time out) the operation and
    /// attempt to roll back partial work.
    pub operation_cancel_after: Option<Duration>,
}

/// A single in-flight request/response exchange or streaming call, established by
/// [`WireTransport::dial`]. Analogous to a raw gRPC channel: framing, compression, and transport
/// security all live below this trait.
#[async_trait]
pub trait RawChannel: Send + Sync + std::fmt::Debug {
    /// Invoke a unary RPC, returning the raw response payload. `params` carries the
    /// `OperationTimeout`/`OperationCancelAfter` bounds to encode onto the request, if the wire
    /// format supports them.
    async fn invoke(&self, method: &str, request: &[u8], params: OperationParams) -> Result<Vec<u8>>;

    /// Open a server-streaming RPC.
    async fn open_stream(&self, method: &str, request: &[u8]) -> Result<Box<dyn RawStream>>;

    /// Cheap local check of whether the underlying channel is still viable; does not perform
    /// network I/O. Used by [`crate::conn::channel::TransportChannel`] to decide whether to
    /// re-dial before issuing a request.
    fn is_usable(&self) -> bool;
}

/// One in-progress streaming response.
#[async_trait]
pub trait RawStream: Send {
    /// Receive the next message, or `None` on clean end-of-stream.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Collaborator responsible for establishing a [`RawChannel`] to an [`Endpoint`]. Implemented
/// outside this crate (e.g. by a gRPC client library); this crate only calls `dial` and uses the
/// resulting channel opaquely.
#[async_trait]
pub trait WireTransport: Send + Sync {
    /// Dial `endpoint`, bounded by `timeout`.
    async fn dial(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Box<dyn RawChannel>>;
}

/// Decorates an outgoing request with authentication and request metadata (auth tokens, client
/// version, request id, and so on). Fallible because acquiring fresh credentials may itself
/// require network access.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// Returns the metadata entries (header name/value pairs) to attach to the next outgoing
    /// call.
    async fn metadata(&self) -> Result<Vec<(String, String)>>;
}

/// A [`CredentialsProvider`] that attaches no metadata at all. Useful for insecure/local
/// deployments and in tests.
#[derive(Debug, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialsProvider for NoCredentials {
    async fn metadata(&self) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }
}
