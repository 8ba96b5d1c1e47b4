//! The Connection: wraps a [`channel::TransportChannel`] with request/stream invocation,
//! metadata injection, timeout application, and the pessimization hook back to the owning
//! cluster.

pub(crate) mod channel;
pub(crate) mod pool;
pub(crate) mod stream;

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    config::ClientConfig,
    endpoint::Endpoint,
    error::{Error, Result},
    event::{
        conn::{OperationEvent, PessimizedEvent, StreamEvent},
        Emitter,
    },
    runtime,
    transport::{CredentialsProvider, OperationParams},
};

pub(crate) use stream::Stream;

/// Runtime state observed by the [`crate::balancer::Balancer`]. Transitions:
/// `Created -> Online` on first successful use, `Online -> Banned` on pessimize, `Banned ->
/// Online` on the first successful use after a ban, and `Online/Banned -> Offline` when the
/// connection is dropped from the active endpoint set (it may still linger, reachable only
/// through in-flight references, until its channel's idle-TTL closes it).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ConnState {
    Unknown = 0,
    Created = 1,
    Online = 2,
    Banned = 3,
    Offline = 4,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnState::Created,
            2 => ConnState::Online,
            3 => ConnState::Banned,
            4 => ConnState::Offline,
            _ => ConnState::Unknown,
        }
    }
}

/// The back-reference a [`Connection`] uses to notify its owning cluster of a pessimize-worthy
/// failure. Implemented as a minimal capability handle rather than a parent pointer, per the
/// cyclic-reference design note: the connection never needs to reach the full `Cluster` API, only
/// this one operation.
pub(crate) trait PessimizeHandle: Send + Sync + std::fmt::Debug {
    fn pessimize(&self, endpoint: &Endpoint, cause: Error);
}

/// A handle that never pessimizes; used for monitoring-only connections and in tests that don't
/// exercise the pessimization path.
#[derive(Debug, Default)]
pub(crate) struct NullPessimizeHandle;

impl PessimizeHandle for NullPessimizeHandle {
    fn pessimize(&self, _endpoint: &Endpoint, _cause: Error) {}
}

pub struct Connection {
    endpoint: Endpoint,
    channel: channel::TransportChannel,
    state: AtomicU8,
    credentials: Arc<dyn CredentialsProvider>,
    pessimize_handle: Arc<dyn PessimizeHandle>,
    exclude_codes_for_pessimization: Vec<i32>,
    request_timeout: Option<Duration>,
    operation_timeout: Option<Duration>,
    operation_cancel_after: Option<Duration>,
    stream_timeout: Option<Duration>,
    operation_events: Emitter<OperationEvent>,
    stream_events: Emitter<StreamEvent>,
    pessimize_events: Emitter<PessimizedEvent>,
}

const PING_METHOD: &str = "/ydb/discovery/v1/ping";

impl Connection {
    pub(crate) fn new(
        endpoint: Endpoint,
        channel: channel::TransportChannel,
        config: &ClientConfig,
        credentials: Arc<dyn CredentialsProvider>,
        pessimize_handle: Arc<dyn PessimizeHandle>,
        operation_events: Emitter<OperationEvent>,
        stream_events: Emitter<StreamEvent>,
        pessimize_events: Emitter<PessimizedEvent>,
    ) -> Self {
        Self {
            endpoint,
            channel,
            state: AtomicU8::new(ConnState::Created as u8),
            credentials,
            pessimize_handle,
            exclude_codes_for_pessimization: config.exclude_codes_for_pessimization.clone(),
            request_timeout: config.request_timeout,
            operation_timeout: config.operation_timeout,
            operation_cancel_after: config.operation_cancel_after,
            stream_timeout: config.stream_timeout,
            operation_events,
            stream_events,
            pessimize_events,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn mark_offline(&self) {
        self.state.store(ConnState::Offline as u8, Ordering::Release);
    }

    fn mark_online(&self) {
        self.state.store(ConnState::Online as u8, Ordering::Release);
    }

    /// Mark this connection `Banned` so the balancer avoids it, and notify the owning cluster so
    /// it can decide whether to trigger a discovery refresh. The caller's error is still returned
    /// to them unchanged; this never swallows an error.
    pub(crate) fn pessimize(&self, cause: Error) {
        self.state.store(ConnState::Banned as u8, Ordering::Release);
        self.pessimize_events.emit(|| PessimizedEvent {
            endpoint: self.endpoint.clone(),
            cause: cause.to_string(),
        });
        self.pessimize_handle.pessimize(&self.endpoint, cause);
    }

    async fn metadata(&self) -> Result<Vec<(String, String)>> {
        self.credentials.metadata().await
    }

    /// Invoke a unary RPC against this connection, applying `RequestTimeout`, injecting
    /// credentials metadata, and pessimizing on a qualifying failure.
    pub async fn invoke(&self, method: &'static str, request: &[u8]) -> Result<Vec<u8>> {
        let started = std::time::Instant::now();
        self.operation_events.emit(|| OperationEvent::Started {
            endpoint: self.endpoint.clone(),
            method,
        });

        let result = self.invoke_inner(method, request).await;

        match &result {
            Ok(_) => {
                self.mark_online();
                self.operation_events.emit(|| OperationEvent::Succeeded {
                    endpoint: self.endpoint.clone(),
                    method,
                    duration: started.elapsed(),
                });
            }
            Err(e) => {
                self.operation_events.emit(|| OperationEvent::Failed {
                    endpoint: self.endpoint.clone(),
                    method,
                    duration: started.elapsed(),
                    error: e.to_string(),
                });
                if e.must_pessimize(&self.exclude_codes_for_pessimization) {
                    self.pessimize(e.clone());
                }
            }
        }

        result
    }

    async fn invoke_inner(&self, method: &str, request: &[u8]) -> Result<Vec<u8>> {
        // Metadata injection may itself fail (e.g. token refresh over the network); that failure
        // is surfaced as the request's error without ever reaching the wire.
        let _metadata = self.metadata().await?;
        let params = OperationParams {
            operation_timeout: self.operation_timeout,
            operation_cancel_after: self.operation_cancel_after,
        };
        let call = self.channel.invoke(method, request, params);
        runtime::maybe_timeout(self.request_timeout, call).await?
    }

    /// Open a server-streaming call, applying `StreamTimeout` to the stream's lifetime.
    pub(crate) async fn new_stream(&self, method: &'static str, request: &[u8]) -> Result<Stream> {
        let _metadata = self.metadata().await?;
        let raw = self.channel.open_stream(method, request).await;
        match raw {
            Ok(raw) => {
                self.stream_events.emit(|| StreamEvent::Opened {
                    endpoint: self.endpoint.clone(),
                    method,
                });
                Ok(Stream::new(
                    raw,
                    self.endpoint.clone(),
                    self.stream_timeout,
                    self.stream_events.clone(),
                ))
            }
            Err(e) => {
                if e.must_pessimize(&self.exclude_codes_for_pessimization) {
                    self.pessimize(e.clone());
                }
                Err(e)
            }
        }
    }

    /// Lightweight liveness probe used by [`crate::cluster::Cluster::get`]'s retry loop; does not
    /// pessimize on failure (the caller loops to the next balancer pick instead).
    pub(crate) async fn ping(&self) -> Result<()> {
        let _metadata = self.metadata().await?;
        self.channel
            .invoke(PING_METHOD, &[], OperationParams::default())
            .await
            .map(|_| ())
    }

    pub(crate) async fn close(&self) {
        self.channel.close().await;
    }

    pub(crate) async fn close_if_idle(&self) -> bool {
        self.channel.close_if_idle().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        event::EventHandler,
        transport::{NoCredentials, OperationParams, RawChannel, RawStream, WireTransport},
    };
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn conn_state_roundtrips() {
        for state in [
            ConnState::Created,
            ConnState::Online,
            ConnState::Banned,
            ConnState::Offline,
        ] {
            assert_eq!(ConnState::from_u8(state as u8), state);
        }
    }

    #[derive(Debug, Default)]
    struct RecordingTransport {
        invoked_with: Arc<StdMutex<Vec<OperationParams>>>,
    }

    #[async_trait]
    impl WireTransport for RecordingTransport {
        async fn dial(&self, _endpoint: &Endpoint, _timeout: Duration) -> Result<Box<dyn RawChannel>> {
            #[derive(Debug)]
            struct RecordingChannel(Arc<StdMutex<Vec<OperationParams>>>);

            #[async_trait]
            impl RawChannel for RecordingChannel {
                async fn invoke(
                    &self,
                    _method: &str,
                    _request: &[u8],
                    params: OperationParams,
                ) -> Result<Vec<u8>> {
                    self.0.lock().unwrap().push(params);
                    Ok(Vec::new())
                }
                async fn open_stream(
                    &self,
                    _method: &str,
                    _request: &[u8],
                ) -> Result<Box<dyn RawStream>> {
                    struct EmptyStream;
                    #[async_trait]
                    impl RawStream for EmptyStream {
                        async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
                            Ok(None)
                        }
                    }
                    Ok(Box::new(EmptyStream))
                }
                fn is_usable(&self) -> bool {
                    true
                }
            }

            Ok(Box::new(RecordingChannel(self.invoked_with.clone())))
        }
    }

    fn connection_with(
        transport: Arc<RecordingTransport>,
        config: &ClientConfig,
        stream_events: Emitter<crate::event::conn::StreamEvent>,
    ) -> Connection {
        let endpoint = Endpoint::new("fake-op:2135");
        let channel = channel::TransportChannel::new(
            endpoint.clone(),
            transport,
            config.dial_timeout,
            config.connection_ttl,
            Emitter::new(None),
        );
        Connection::new(
            endpoint,
            channel,
            config,
            Arc::new(NoCredentials),
            Arc::new(NullPessimizeHandle),
            Emitter::new(None),
            stream_events,
            Emitter::new(None),
        )
    }

    #[tokio::test]
    async fn invoke_threads_operation_timeout_and_cancel_after_to_the_transport() {
        let config = ClientConfig::builder()
            .endpoint("bootstrap:2135")
            .database("/local")
            .operation_timeout(Duration::from_secs(3))
            .operation_cancel_after(Duration::from_secs(9))
            .build();
        let transport = Arc::new(RecordingTransport::default());
        let conn = connection_with(transport.clone(), &config, Emitter::new(None));

        conn.invoke("/ydb/test/v1/do", &[]).await.unwrap();

        let seen = transport.invoked_with.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].operation_timeout, Some(Duration::from_secs(3)));
        assert_eq!(seen[0].operation_cancel_after, Some(Duration::from_secs(9)));
    }

    #[tokio::test]
    async fn new_stream_emits_opened_event() {
        let config = ClientConfig::builder()
            .endpoint("bootstrap:2135")
            .database("/local")
            .build();
        let transport = Arc::new(RecordingTransport::default());
        let opened = Arc::new(StdMutex::new(false));
        let opened2 = opened.clone();
        let events = Emitter::new(Some(EventHandler::callback(move |event| {
            if matches!(event, crate::event::conn::StreamEvent::Opened { .. }) {
                *opened2.lock().unwrap() = true;
            }
        })));
        let conn = connection_with(transport, &config, events);

        conn.new_stream("/ydb/test/v1/stream", &[]).await.unwrap();

        assert!(*opened.lock().unwrap());
    }
}

/// Lightweight `Connection` construction for balancer/cluster unit tests, where no real dial
/// ever happens and only `state()`/`endpoint()` are exercised.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::transport::{NoCredentials, OperationParams, RawChannel, RawStream, WireTransport};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct UnreachableTransport;

    #[async_trait]
    impl WireTransport for UnreachableTransport {
        async fn dial(&self, _endpoint: &Endpoint, _timeout: Duration) -> Result<Box<dyn RawChannel>> {
            Err(Error::internal("test connection should never dial"))
        }
    }

    #[async_trait]
    #[allow(dead_code)]
    impl RawChannel for UnreachableTransport {
        async fn invoke(
            &self,
            _method: &str,
            _request: &[u8],
            _params: OperationParams,
        ) -> Result<Vec<u8>> {
            unreachable!()
        }
        async fn open_stream(&self, _method: &str, _request: &[u8]) -> Result<Box<dyn RawStream>> {
            unreachable!()
        }
        fn is_usable(&self) -> bool {
            false
        }
    }

    pub(crate) fn fake_connection(id: u32, state: ConnState) -> Arc<Connection> {
        let endpoint = Endpoint::new(format!("fake-{id}:2135"));
        let config = ClientConfig::builder()
            .endpoint("bootstrap:2135")
            .database("/local")
            .build();
        let channel = channel::TransportChannel::new(
            endpoint.clone(),
            Arc::new(UnreachableTransport),
            config.dial_timeout,
            config.connection_ttl,
            Emitter::new(None),
        );
        let conn = Connection::new(
            endpoint,
            channel,
            &config,
            Arc::new(NoCredentials),
            Arc::new(NullPessimizeHandle),
            Emitter::new(None),
            Emitter::new(None),
            Emitter::new(None),
        );
        conn.state.store(state as u8, Ordering::Release);
        Arc::new(conn)
    }

    pub(crate) fn state_of(conn: &Arc<Connection>) -> ConnState {
        conn.state()
    }
}
