//! Contains the `Error` and `Result` types that this crate uses.

use std::{collections::HashSet, fmt, sync::Arc};

use thiserror::Error;

use crate::endpoint::Endpoint;

/// The result type for all methods that can return an error in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while operating the connection fabric or session pool. The inner
/// [`ErrorKind`] is boxed to keep `Error` small and to allow it to be cloned cheaply, which
/// matters because the same cause is frequently delivered to several waiters or tracer hooks
/// at once (e.g. a pool-cleared cause broadcast to every queued session waiter).
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The kind of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            labels: HashSet::new(),
            source: None,
        }
    }

    pub(crate) fn with_source(kind: ErrorKind, source: Error) -> Self {
        Self {
            kind: Box::new(kind),
            labels: HashSet::new(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    /// Labels attached to this error (e.g. retry classification hints surfaced to callers).
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn transport(endpoint: Endpoint, message: impl Into<String>) -> Error {
        ErrorKind::Transport {
            endpoint,
            message: message.into(),
        }
        .into()
    }

    /// Whether this error should cause the connection it originated from to be pessimized, per
    /// the exclusion list configured for the client.
    pub(crate) fn must_pessimize(&self, excluded_codes: &[i32]) -> bool {
        match self.kind.as_ref() {
            ErrorKind::Transport { .. } | ErrorKind::Timeout { .. } => true,
            ErrorKind::Operation { code, .. } => !excluded_codes.contains(code),
            _ => false,
        }
    }

    pub(crate) fn is_bad_session(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::BadSession { .. })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Cancelled | ErrorKind::DeadlineExceeded)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

/// The taxonomy of errors surfaced by this crate. Every fallible operation returns
/// `Result<T, Error>`, and no kind here is ever silently downgraded or dropped: callers always
/// observe the same terminal outcome that tracer hooks observe.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A transport-level failure: dial refused, channel entered a transient-failure state, or an
    /// I/O error occurred while reading or writing on an established channel.
    #[error("transport error talking to {endpoint}: {message}")]
    #[non_exhaustive]
    Transport { endpoint: Endpoint, message: String },

    /// The server rejected the operation. This never pessimizes the connection by default; it is
    /// surfaced to the caller verbatim along with the server's status code and any issues.
    #[error("operation failed with status {code}: {message}")]
    #[non_exhaustive]
    Operation {
        code: i32,
        message: String,
        issues: Vec<String>,
    },

    /// A specific [`ErrorKind::Operation`] that invalidates the session it occurred on. The
    /// session pool deletes the session instead of returning it to the idle list.
    #[error("session {session_id} is no longer usable: {message}")]
    #[non_exhaustive]
    BadSession { session_id: String, message: String },

    /// Returned by `Cluster::get`/`Cluster::pessimize`/`Cluster::close` once the cluster has been
    /// closed. Terminal: the cluster never reopens.
    #[error("cluster is closed")]
    ClusterClosed,

    /// Returned by the session pool once `close` has completed. Terminal.
    #[error("session pool is closed")]
    PoolClosed,

    /// The balancer's snapshot contained no usable connections.
    #[error("cluster has no usable endpoints")]
    ClusterEmpty,

    /// The session pool is at `SizeLimit` and the wait queue itself is bounded and full, or a
    /// caller attempted to put back more sessions than the pool can hold.
    #[error("session pool is full")]
    PoolOverflow,

    /// A caller's context/cancellation token fired while the operation was pending.
    #[error("operation was cancelled")]
    Cancelled,

    /// A deadline elapsed before the operation completed (e.g. `MaxGetConnTimeout`,
    /// `CreateSessionTimeout`).
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The discovery RPC collaborator returned an error.
    #[error("discovery failed: {message}")]
    #[non_exhaustive]
    Discovery { message: String },

    /// The credentials/metadata collaborator failed to decorate an outgoing request.
    #[error("failed to attach credentials: {message}")]
    #[non_exhaustive]
    Credentials { message: String },

    /// An invariant was violated in a way that indicates a bug in this crate rather than any
    /// external failure.
    #[error("internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// A timeout elapsed waiting on a resource (e.g. a wait-queue slot) with no more specific
    /// classification available.
    #[error("timed out waiting for {resource}")]
    #[non_exhaustive]
    Timeout { resource: String },

    /// An invalid argument was supplied to a constructor (e.g. `Single` balancer given more than
    /// one connection).
    #[error("invalid argument: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for ErrorKind {
    fn from(e: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        ErrorKind::from(e).into()
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ErrorKind::DeadlineExceeded.into()
    }
}

/// Helper used across the balancer/cluster/session-pool modules to format a concise debug label
/// without pulling `Display` into scope everywhere.
pub(crate) fn fmt_source_chain(err: &Error, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", err.kind)?;
    let mut cur = err.source.as_deref();
    while let Some(e) = cur {
        write!(f, ": {}", e.kind)?;
        cur = e.source.as_deref();
    }
    Ok(())
}
