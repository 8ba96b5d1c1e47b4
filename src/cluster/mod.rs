//! The Cluster: owns the current set of endpoints, composes balancers, serves `get`, and applies
//! discovery updates. See `SPEC_FULL.md` §4.5 for the contract and §9 for why the generation
//! pointer is a short-critical-section `RwLock<Arc<Generation>>` rather than a lock-free atomic
//! (DESIGN.md records the rationale).

mod diff;
mod discovery;
mod generation;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock, Weak,
    },
};

pub use discovery::DiscoveryClient;
pub(crate) use discovery::StaticDiscovery;

use generation::Generation;

use crate::{
    balancer::{self, accept_all, Balancer, Composite, ContextPinned},
    config::{ClientConfig, MAX_GET_CONN_TIMEOUT},
    conn::{pool::ConnectionPool, Connection, ConnState, PessimizeHandle},
    endpoint::Endpoint,
    error::{Error, ErrorKind, Result},
    event::{
        cluster::{
            ClusterClosedEvent, ClusterGetEvent, ClusterInitEvent, ClusterMembershipEvent,
            DiscoveryEvent,
        },
        conn::{DialCompletedEvent, OperationEvent, PessimizedEvent, StreamEvent},
        Emitter,
    },
    runtime::{self, CancellationToken},
    transport::{CredentialsProvider, WireTransport},
};

/// Cluster-scoped event emitters, grouped so [`Cluster::new`] doesn't take eight positional
/// arguments. Every field defaults to "no handler registered" (only the `tracing-unstable`
/// emission fires) unless the caller wires one up.
#[derive(Clone, Default)]
pub struct ClusterEventEmitters {
    pub dial: Emitter<DialCompletedEvent>,
    pub operation: Emitter<OperationEvent>,
    pub stream: Emitter<StreamEvent>,
    pub pessimize: Emitter<PessimizedEvent>,
    pub get: Emitter<ClusterGetEvent>,
    pub membership: Emitter<ClusterMembershipEvent>,
    pub discovery: Emitter<DiscoveryEvent>,
    pub init: Emitter<ClusterInitEvent>,
    pub closed: Emitter<ClusterClosedEvent>,
}

struct ClusterState {
    config: ClientConfig,
    pool: Arc<ConnectionPool>,
    discovery_client: Arc<dyn DiscoveryClient>,
    generation: RwLock<Arc<Generation>>,
    repeater: RwLock<Option<discovery::RepeaterHandle>>,
    /// Watches the current generation's balancer for its edge-triggered "half unusable" signal
    /// and forces a discovery round when it fires. Replaced (and the old one aborted) on every
    /// generation swap, since the signal is scoped to the snapshot it was built over and a stale
    /// watcher would otherwise wait on a balancer no one else references anymore -- a goroutine
    /// leak the Composite design note explicitly calls out to avoid.
    refresh_watcher: std::sync::Mutex<Option<runtime::AsyncJoinHandle<()>>>,
    closed: AtomicBool,
    events: ClusterEventEmitters,
}

impl ClusterState {
    fn current(&self) -> Arc<Generation> {
        self.generation.read().expect("generation lock poisoned").clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn build_balancer(&self, conns: Vec<Arc<Connection>>) -> Arc<dyn Balancer> {
        let policy = balancer::build(self.config.balancer, conns.clone());
        Arc::new(Composite::new(vec![
            (accept_all(), Arc::new(ContextPinned::new(conns)) as Arc<dyn Balancer>),
            (accept_all(), policy),
        ]))
    }

    /// One discovery round: call the collaborator, diff against the current generation for
    /// membership events, take/release pool references, and atomically publish the result.
    async fn refresh(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }

        self.events.discovery.emit(|| DiscoveryEvent::Started);
        let started = std::time::Instant::now();

        let mut endpoints = match self.discovery_client.discover().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                self.events.discovery.emit(|| DiscoveryEvent::Failed {
                    duration: started.elapsed(),
                    error: e.to_string(),
                });
                return;
            }
        };
        endpoints.sort();

        let old_gen = self.current();
        let (added, removed) = diff::diff(&old_gen.endpoints, &endpoints);
        for endpoint in &added {
            self.events
                .membership
                .emit(|| ClusterMembershipEvent::Inserted { endpoint: (*endpoint).clone() });
        }
        for endpoint in &removed {
            self.events
                .membership
                .emit(|| ClusterMembershipEvent::Removed { endpoint: (*endpoint).clone() });
        }

        let pessimize_handle: Arc<dyn PessimizeHandle> = Arc::new(ClusterPessimizeHandle {
            state: Arc::downgrade(self),
        });

        let mut conns_by_address = HashMap::with_capacity(endpoints.len());
        let mut conns_by_node_id = HashMap::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            let conn = self.pool.take(endpoint, pessimize_handle.clone()).await;
            conns_by_address.insert(endpoint.address().to_string(), conn.clone());
            if endpoint.node_id() != 0 {
                conns_by_node_id.insert(endpoint.node_id(), conn);
            }
        }

        let endpoint_count = endpoints.len();
        let balancer = self.build_balancer(conns_by_address.values().cloned().collect());
        let new_gen = Arc::new(Generation {
            endpoints,
            conns_by_address,
            conns_by_node_id,
            balancer,
        });

        *self.generation.write().expect("generation lock poisoned") = new_gen.clone();
        self.rearm_refresh_watcher(&new_gen);

        // Drop the previous generation's pool references now that the new generation holds its
        // own. Addresses present in both generations net to zero (take then release); addresses
        // only in the old generation are released down to zero and closed by the pool.
        for endpoint in &old_gen.endpoints {
            self.pool.release(endpoint.address()).await;
        }

        self.events.discovery.emit(|| DiscoveryEvent::Succeeded {
            endpoint_count,
            duration: started.elapsed(),
        });
    }

    /// Spawn a task that waits on `generation`'s balancer's own "half unusable" signal and forces
    /// a discovery round when it fires, replacing (and aborting) whatever watcher was armed for
    /// the previous generation. This is a second, balancer-driven path to the same
    /// `Force()` [`on_pessimize`] already triggers directly off the pessimize count -- the two
    /// agree in practice since both use the same threshold, but only the balancer itself knows
    /// when a composite child's own sub-snapshot degrades, which `on_pessimize`'s generation-wide
    /// count can miss.
    fn rearm_refresh_watcher(self: &Arc<Self>, generation: &Arc<Generation>) {
        let mut sub = generation.balancer.refresh_signal();
        let state = self.clone();
        let handle = runtime::spawn(async move {
            sub.wait().await;
            if let Some(force) = state.repeater.read().expect("repeater lock poisoned").clone() {
                force.force();
            }
        });
        let old = self
            .refresh_watcher
            .lock()
            .expect("refresh watcher lock poisoned")
            .replace(handle);
        if let Some(old) = old {
            old.abort();
        }
    }

    async fn on_pessimize(self: &Arc<Self>, address: &str, cause: Error) {
        self.pool.pessimize(address, cause).await;

        let gen = self.current();
        let total = gen.connection_count();
        if total == 0 {
            return;
        }
        let unusable = gen
            .conns_by_address
            .values()
            .filter(|c| !matches!(c.state(), ConnState::Online | ConnState::Created))
            .count();
        if unusable * 2 > total {
            if let Some(force) = self.repeater.read().expect("repeater lock poisoned").clone() {
                force.force();
            }
        }
    }
}

/// The back-reference a [`Connection`] uses to notify the cluster of a pessimize-worthy failure.
/// Holds only a [`Weak`] reference so the Connection -> Cluster edge never keeps the cluster
/// (and, transitively, the connection itself) alive past the last external `Arc<Cluster>`.
struct ClusterPessimizeHandle {
    state: Weak<ClusterState>,
}

impl std::fmt::Debug for ClusterPessimizeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterPessimizeHandle").finish_non_exhaustive()
    }
}

impl PessimizeHandle for ClusterPessimizeHandle {
    fn pessimize(&self, endpoint: &Endpoint, cause: Error) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let address = endpoint.address().to_string();
        runtime::spawn(async move {
            state.on_pessimize(&address, cause).await;
        });
    }
}

/// Owns the live [`Generation`], the [`ConnectionPool`] backing it, and the discovery repeater
/// task. `Cluster::get` is the hot path every other subsystem in this crate eventually calls
/// through; everything else is maintenance.
pub struct Cluster {
    state: Arc<ClusterState>,
    repeater: crate::runtime::AsyncJoinHandle<()>,
    idle_sweep: crate::runtime::AsyncJoinHandle<()>,
}

impl Cluster {
    /// Construct a cluster and perform one blocking discovery round before returning, so the
    /// first `get` call never has to wait on it.
    pub async fn new(
        config: ClientConfig,
        transport: Arc<dyn WireTransport>,
        credentials: Arc<dyn CredentialsProvider>,
        discovery_client: Arc<dyn DiscoveryClient>,
        events: ClusterEventEmitters,
    ) -> Result<Self> {
        events.init.emit(|| ClusterInitEvent {
            bootstrap_endpoint: config.endpoint.clone(),
        });

        let pool = Arc::new(ConnectionPool::new(
            transport,
            credentials,
            config.clone(),
            events.dial.clone(),
            events.operation.clone(),
            events.stream.clone(),
            events.pessimize.clone(),
        ));

        let empty_balancer = balancer::build(config.balancer, Vec::new());
        let state = Arc::new(ClusterState {
            closed: AtomicBool::new(false),
            generation: RwLock::new(Arc::new(Generation::empty(empty_balancer))),
            repeater: RwLock::new(None),
            refresh_watcher: std::sync::Mutex::new(None),
            pool,
            discovery_client,
            config: config.clone(),
            events,
        });

        state.refresh().await;

        let repeater_state = state.clone();
        let (repeater_handle, repeater_join) =
            discovery::spawn(config.discovery_interval, move || {
                let repeater_state = repeater_state.clone();
                async move { repeater_state.refresh().await }
            });
        *state.repeater.write().expect("repeater lock poisoned") = Some(repeater_handle);

        let idle_sweep =
            crate::conn::pool::spawn_idle_sweep(state.pool.clone(), config.connection_ttl);

        Ok(Self {
            state,
            repeater: repeater_join,
            idle_sweep,
        })
    }

    /// Select and verify a connection, retrying within an upper bound of
    /// [`crate::config::MAX_GET_CONN_TIMEOUT`]. `pin`, if given, is the endpoint address the
    /// calling request wants pinned (see [`crate::balancer::ContextPinned`]).
    pub async fn get(&self, cancel: &CancellationToken, pin: Option<&str>) -> Result<Arc<Connection>> {
        let started = std::time::Instant::now();
        let result = self.get_inner(cancel, pin).await;
        self.state.events.get.emit(|| ClusterGetEvent {
            endpoint: result.as_ref().ok().map(|c| c.endpoint().clone()),
            duration: started.elapsed(),
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    async fn get_inner(&self, cancel: &CancellationToken, pin: Option<&str>) -> Result<Arc<Connection>> {
        if self.state.is_closed() {
            return Err(ErrorKind::ClusterClosed.into());
        }

        let deadline = tokio::time::sleep(MAX_GET_CONN_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            if self.state.is_closed() {
                return Err(ErrorKind::ClusterClosed.into());
            }

            let generation = self.state.current();
            let Some(conn) = generation.balancer.next_pinned(pin) else {
                return Err(ErrorKind::ClusterEmpty.into());
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ErrorKind::Cancelled.into()),
                _ = &mut deadline => return Err(ErrorKind::DeadlineExceeded.into()),
                result = conn.ping() => {
                    if result.is_ok() {
                        return Ok(conn);
                    }
                    // Ping failed: loop around and let the balancer pick again. The connection
                    // has already pessimized itself via its `PessimizeHandle` if warranted.
                }
            }
        }
    }

    /// Forward a pessimize-worthy failure observed outside the normal `Connection::invoke` path
    /// (e.g. by a caller holding the connection directly) and evaluate whether to force
    /// discovery. Most pessimization happens automatically through the `PessimizeHandle` a
    /// `Connection` is constructed with; this is for callers that need to report one explicitly.
    pub async fn pessimize(&self, conn: &Connection, cause: Error) {
        self.state.on_pessimize(conn.endpoint().address(), cause).await;
    }

    /// Stop the repeater, release the connection pool, and mark the cluster closed. Idempotent:
    /// subsequent calls, and every subsequent `get`, observe [`ErrorKind::ClusterClosed`].
    pub async fn close(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.repeater.abort();
        self.idle_sweep.abort();
        if let Some(watcher) = self
            .state
            .refresh_watcher
            .lock()
            .expect("refresh watcher lock poisoned")
            .take()
        {
            watcher.abort();
        }
        self.state.pool.close_all().await;
        self.state.events.closed.emit(|| ClusterClosedEvent);
    }
}
