//! The Connection Pool: interns [`Connection`]s by endpoint address and reference-counts them
//! across [`crate::cluster::Cluster`] generations so that an address present in two consecutive
//! discovery results reuses the same `Connection` instead of re-dialing.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;

use crate::{
    config::ClientConfig,
    conn::{channel::TransportChannel, Connection, PessimizeHandle},
    endpoint::Endpoint,
    error::Error,
    event::{
        conn::{DialCompletedEvent, OperationEvent, PessimizedEvent, StreamEvent},
        Emitter,
    },
    runtime,
    transport::{CredentialsProvider, WireTransport},
};

struct Entry {
    conn: Arc<Connection>,
    refcount: u32,
}

/// Owns every live [`Connection`], keyed by [`Endpoint::address`]. The pool is the sole owner: a
/// cluster `Generation` only ever holds a non-owning `Arc` clone obtained through
/// [`ConnectionPool::take`].
pub(crate) struct ConnectionPool {
    transport: Arc<dyn WireTransport>,
    credentials: Arc<dyn CredentialsProvider>,
    config: ClientConfig,
    entries: Mutex<HashMap<String, Entry>>,
    dial_events: Emitter<DialCompletedEvent>,
    operation_events: Emitter<OperationEvent>,
    stream_events: Emitter<StreamEvent>,
    pessimize_events: Emitter<PessimizedEvent>,
}

impl ConnectionPool {
    pub(crate) fn new(
        transport: Arc<dyn WireTransport>,
        credentials: Arc<dyn CredentialsProvider>,
        config: ClientConfig,
        dial_events: Emitter<DialCompletedEvent>,
        operation_events: Emitter<OperationEvent>,
        stream_events: Emitter<StreamEvent>,
        pessimize_events: Emitter<PessimizedEvent>,
    ) -> Self {
        Self {
            transport,
            credentials,
            config,
            entries: Mutex::new(HashMap::new()),
            dial_events,
            operation_events,
            stream_events,
            pessimize_events,
        }
    }

    /// Take a reference to the connection for `endpoint`, creating it if this is the first
    /// generation to reference this address. Dialing itself is lazy: the returned `Connection` is
    /// not guaranteed to be dialed yet.
    pub(crate) async fn take(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        pessimize_handle: Arc<dyn PessimizeHandle>,
    ) -> Arc<Connection> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(endpoint.address()) {
            entry.refcount += 1;
            return entry.conn.clone();
        }

        let channel = TransportChannel::new(
            endpoint.clone(),
            self.transport.clone(),
            self.config.dial_timeout,
            self.config.connection_ttl,
            self.dial_events.clone(),
        );
        let conn = Arc::new(Connection::new(
            endpoint.clone(),
            channel,
            &self.config,
            self.credentials.clone(),
            pessimize_handle,
            self.operation_events.clone(),
            self.stream_events.clone(),
            self.pessimize_events.clone(),
        ));
        entries.insert(
            endpoint.address().to_string(),
            Entry {
                conn: conn.clone(),
                refcount: 1,
            },
        );
        conn
    }

    /// Release a reference previously obtained via [`ConnectionPool::take`]. Once the last
    /// reference to an address is released, the underlying connection is closed and dropped from
    /// the pool.
    pub(crate) async fn release(&self, address: &str) {
        let conn = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(address) else {
                return;
            };
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount > 0 {
                return;
            }
            entries.remove(address).map(|e| e.conn)
        };

        if let Some(conn) = conn {
            conn.mark_offline();
            conn.close().await;
        }
    }

    pub(crate) async fn pessimize(&self, address: &str, cause: Error) {
        let conn = {
            let entries = self.entries.lock().await;
            entries.get(address).map(|e| e.conn.clone())
        };
        if let Some(conn) = conn {
            conn.pessimize(cause);
        }
    }

    /// Close every connection currently held, regardless of refcount. Used by
    /// `Cluster::close`.
    pub(crate) async fn close_all(&self) {
        let entries = {
            let mut entries = self.entries.lock().await;
            std::mem::take(&mut *entries)
        };
        for (_, entry) in entries {
            entry.conn.mark_offline();
            entry.conn.close().await;
        }
    }

    /// Background maintenance: close the physical channel of any connection that has been idle
    /// for longer than `connection_ttl`. The `Connection` itself persists; it lazily re-dials on
    /// next use.
    pub(crate) async fn close_idle_channels(&self) {
        let conns: Vec<Arc<Connection>> = {
            let entries = self.entries.lock().await;
            entries.values().map(|e| e.conn.clone()).collect()
        };
        for conn in conns {
            conn.close_if_idle().await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn refcount(&self, address: &str) -> Option<u32> {
        self.entries.lock().await.get(address).map(|e| e.refcount)
    }
}

/// Spawns the periodic idle-channel sweep for a pool; returns a handle that must be `.abort()`ed
/// explicitly to stop the sweep, since dropping a `tokio` join handle does not cancel its task.
pub(crate) fn spawn_idle_sweep(
    pool: Arc<ConnectionPool>,
    period: std::time::Duration,
) -> runtime::AsyncJoinHandle<()> {
    runtime::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            pool.close_idle_channels().await;
        }
    })
}
