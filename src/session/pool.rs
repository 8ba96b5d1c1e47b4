//! The Session Pool: the most delicate component in this crate. See `SPEC_FULL.md` §4.7 for the
//! contract this module implements operation by operation.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::sync::{oneshot, Mutex, Notify};

use crate::{
    cluster::Cluster,
    config::SessionPoolConfig,
    conn::Connection,
    error::{Error, ErrorKind, Result},
    event::{
        session::{
            SessionCloseEvent, SessionCreateEvent, SessionGetEvent, SessionPutEvent,
            SessionTakeEvent,
        },
        Emitter,
    },
    runtime::{self, AsyncJoinHandle, CancellationToken},
    session::{factory::SessionFactory, keeper, Session},
};

/// Session-pool-scoped event emitters, one field per operation named in the tracer-hooks
/// contract (§4.9). As with [`crate::cluster::ClusterEventEmitters`], every field defaults to "no
/// handler registered".
#[derive(Clone, Default)]
pub struct SessionPoolEventEmitters {
    pub create: Emitter<SessionCreateEvent>,
    pub get: Emitter<SessionGetEvent>,
    pub put: Emitter<SessionPutEvent>,
    pub take: Emitter<SessionTakeEvent>,
    pub close: Emitter<SessionCloseEvent>,
}

pub(crate) struct Record {
    pub(crate) session: Arc<Session>,
    pub(crate) touched: Instant,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Arc<Session>>,
}

pub(crate) struct Inner {
    /// Every session id this pool currently tracks, idle or checked out, plus reservations for
    /// in-flight `Create` calls that have not registered yet. `index.len() + reserved` is the
    /// quantity bounded by `SizeLimit`.
    pub(crate) index: HashSet<String>,
    reserved: usize,
    /// Ascending by `touched`; head is the keepalive keeper's next target.
    pub(crate) idle: VecDeque<Record>,
    waiters: VecDeque<Waiter>,
    /// The session id currently popped out for a keepalive round, if any. [`SessionPool::take`]
    /// waits on [`SessionPool::keeper_done`] rather than spinning when it finds this set.
    pub(crate) keepaliving: Option<String>,
    /// Consecutive successful keepalives per session id, reset when the id leaves the index.
    pub(crate) keepalive_counts: std::collections::HashMap<String, u32>,
}

/// The session pool's shared state, as seen by both the public [`SessionPool`] handle and the
/// background keeper task in [`keeper`].
pub(crate) struct PoolState {
    pub(crate) config: SessionPoolConfig,
    pub(crate) cluster: Arc<Cluster>,
    pub(crate) factory: Arc<dyn SessionFactory>,
    pub(crate) events: SessionPoolEventEmitters,
    pub(crate) inner: Mutex<Inner>,
    /// Wakes the keeper when the idle list may have gained a new (earlier) head.
    pub(crate) keeper_wake: Notify,
    /// Notified once per completed keepalive round; [`SessionPool::take`] waits on this rather
    /// than polling when a session it wants is mid-keepalive.
    pub(crate) keeper_done: Notify,
    pub(crate) shutdown: CancellationToken,
    closed: AtomicBool,
    next_waiter_id: AtomicU64,
}

impl PoolState {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Re-insert an idle session at the position that keeps the list ascending by `touched`,
    /// rather than assuming it belongs at the tail. A keepalive round can complete after a
    /// concurrent `Put` landed with a later-but-still-smaller `touched` than this session's
    /// recorded one (the session's `touched` is captured when the keepalive round *starts*, so a
    /// `Put` that lands mid-round can sort ahead of it); blind tail insertion would violate the
    /// ascending invariant in that case.
    pub(crate) async fn reinsert_idle(&self, session: Arc<Session>, touched: Instant) {
        let mut inner = self.inner.lock().await;
        let pos = inner
            .idle
            .iter()
            .position(|r| r.touched > touched)
            .unwrap_or(inner.idle.len());
        inner.idle.insert(pos, Record { session, touched });
        drop(inner);
        self.keeper_wake.notify_one();
    }

    /// Delete a session that the keeper is giving up on (bad session, or aged out past
    /// `IdleKeepAliveThreshold`). Removes it from the index, best-effort-deletes it on the
    /// server, and fires the close hook.
    pub(crate) async fn retire(&self, session: Arc<Session>, reason: RetireReason) {
        {
            let mut inner = self.inner.lock().await;
            inner.index.remove(session.id());
            inner.keepalive_counts.remove(session.id());
        }
        session.mark_closed();
        self.delete_best_effort(&session).await;
        self.events.close.emit(|| match reason {
            RetireReason::BadSession | RetireReason::AgedOut => {
                SessionCloseEvent::KeeperDeleted { session_id: session.id().to_string() }
            }
            RetireReason::PoolClosed => {
                SessionCloseEvent::PoolClosed { session_id: session.id().to_string() }
            }
        });
    }

    /// Best-effort `DeleteSession` RPC; failures are not surfaced since the pool has already
    /// dropped the session from its own bookkeeping either way.
    pub(crate) async fn delete_best_effort(&self, session: &Session) {
        let cancel = CancellationToken::new();
        let Ok(conn) = self.cluster.get(&cancel, None).await else {
            return;
        };
        let _ = runtime::timeout(
            self.config.create_session_timeout,
            self.factory.delete_session(&conn, session),
        )
        .await;
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum RetireReason {
    BadSession,
    AgedOut,
    PoolClosed,
}

/// Handle to the table-service session pool. Cheap to clone (an `Arc` around [`PoolState`]); the
/// keeper task holds its own clone and outlives any individual handle.
#[derive(Clone)]
pub struct SessionPool {
    state: Arc<PoolState>,
    keeper: Arc<AsyncJoinHandle<()>>,
}

impl SessionPool {
    pub fn new(
        config: SessionPoolConfig,
        cluster: Arc<Cluster>,
        factory: Arc<dyn SessionFactory>,
        events: SessionPoolEventEmitters,
    ) -> Self {
        let state = Arc::new(PoolState {
            config,
            cluster,
            factory,
            events,
            inner: Mutex::new(Inner {
                index: HashSet::new(),
                reserved: 0,
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                keepaliving: None,
                keepalive_counts: std::collections::HashMap::new(),
            }),
            keeper_wake: Notify::new(),
            keeper_done: Notify::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            next_waiter_id: AtomicU64::new(0),
        });

        let keeper = keeper::spawn(state.clone());

        Self {
            state,
            keeper: Arc::new(keeper),
        }
    }

    /// Always performs a `CreateSession` round-trip; never consults the idle list.
    pub async fn create(&self, cancel: &CancellationToken) -> Result<Arc<Session>> {
        if self.state.is_closed() {
            return Err(ErrorKind::PoolClosed.into());
        }

        self.state.events.create.emit(|| SessionCreateEvent::Started);
        let started = Instant::now();
        let result = self.create_unchecked(cancel).await;
        match &result {
            Ok(session) => {
                self.state.events.create.emit(|| SessionCreateEvent::Succeeded {
                    session_id: session.id().to_string(),
                    duration: started.elapsed(),
                });
            }
            Err(e) => {
                self.state.events.create.emit(|| SessionCreateEvent::Failed {
                    duration: started.elapsed(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    /// `CreateSession` without the pool-level bookkeeping that `get` needs (reservation
    /// accounting, event names distinguishing a bare `Create` from a `Get`-triggered create). Used
    /// directly by [`SessionPool::create`] and, with its own reservation already held, by
    /// [`SessionPool::get`].
    async fn create_unchecked(&self, cancel: &CancellationToken) -> Result<Arc<Session>> {
        let conn = self.state.cluster.get(cancel, None).await?;
        let deadline = tokio::time::sleep(self.state.config.create_session_timeout);
        tokio::pin!(deadline);

        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ErrorKind::Cancelled.into()),
            _ = &mut deadline => return Err(ErrorKind::DeadlineExceeded.into()),
            result = self.state.factory.create_session(&conn) => result?,
        };

        let session = Arc::new(session);
        let mut inner = self.state.inner.lock().await;
        inner.index.insert(session.id().to_string());
        Ok(session)
    }

    /// Returns an idle session if any; else creates one if under `SizeLimit`; else waits for
    /// another caller's `put`.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<Arc<Session>> {
        if self.state.is_closed() {
            return Err(ErrorKind::PoolClosed.into());
        }

        self.state.events.get.emit(|| SessionGetEvent::Started);

        if let Some(session) = self.pop_idle().await {
            self.state.events.get.emit(|| SessionGetEvent::HitIdle {
                session_id: session.id().to_string(),
            });
            return Ok(session);
        }

        if self.try_reserve().await {
            match self.create_unchecked(cancel).await {
                Ok(session) => {
                    self.state.events.get.emit(|| SessionGetEvent::Created {
                        session_id: session.id().to_string(),
                    });
                    return Ok(session);
                }
                Err(e) => {
                    self.release_reservation().await;
                    self.state.events.get.emit(|| SessionGetEvent::Failed {
                        duration: Duration::ZERO,
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }

        let started = Instant::now();
        match self.wait_for_put(cancel).await {
            Ok(session) => {
                self.state.events.get.emit(|| SessionGetEvent::Waited {
                    session_id: session.id().to_string(),
                    wait_duration: started.elapsed(),
                });
                Ok(session)
            }
            Err(e) => {
                self.state.events.get.emit(|| SessionGetEvent::Failed {
                    duration: started.elapsed(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn pop_idle(&self) -> Option<Arc<Session>> {
        let mut inner = self.state.inner.lock().await;
        inner.idle.pop_front().map(|r| r.session)
    }

    async fn try_reserve(&self) -> bool {
        let mut inner = self.state.inner.lock().await;
        if inner.index.len() + inner.reserved < self.state.config.size_limit {
            inner.reserved += 1;
            true
        } else {
            false
        }
    }

    async fn release_reservation(&self) {
        let mut inner = self.state.inner.lock().await;
        inner.reserved = inner.reserved.saturating_sub(1);
    }

    /// Enqueue this caller on the wait queue and block until `put` delivers a session directly,
    /// the pool closes, or `cancel` fires. Mirrors `SPEC_FULL.md`'s "racy" contract: a caller
    /// whose cancellation races a concurrent `put` may still receive a session in the channel even
    /// after losing the race, and must hand it back via `put` rather than drop it.
    async fn wait_for_put(&self, cancel: &CancellationToken) -> Result<Arc<Session>> {
        let (tx, mut rx) = oneshot::channel();
        let waiter_id = self.state.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.state.inner.lock().await;
            inner.waiters.push_back(Waiter { id: waiter_id, tx });
        }

        let deadline = tokio::time::sleep(self.state.config.create_session_timeout);
        tokio::pin!(deadline);

        tokio::select! {
            res = &mut rx => res.map_err(|_| ErrorKind::PoolClosed.into()),
            _ = cancel.cancelled() => {
                self.abandon_wait(waiter_id, &mut rx).await;
                Err(ErrorKind::Cancelled.into())
            }
            _ = &mut deadline => {
                self.abandon_wait(waiter_id, &mut rx).await;
                Err(ErrorKind::DeadlineExceeded.into())
            }
        }
    }

    /// Removes a waiter that gave up (via cancellation or timeout) from the wait queue. If the
    /// waiter had already been dequeued by a concurrent `put` by the time this runs, that `put`
    /// already completed its (synchronous, non-`await`ing) send under the same pool lock this
    /// method also takes, so the value is already sitting in `rx` and must be handed back.
    async fn abandon_wait(&self, waiter_id: u64, rx: &mut oneshot::Receiver<Arc<Session>>) {
        let still_queued = {
            let mut inner = self.state.inner.lock().await;
            let pos = inner.waiters.iter().position(|w| w.id == waiter_id);
            if let Some(pos) = pos {
                inner.waiters.remove(pos);
                true
            } else {
                false
            }
        };

        if still_queued {
            return;
        }

        if let Ok(session) = rx.try_recv() {
            // Best-effort: this is the pool returning the session on the abandoned waiter's
            // behalf, not the waiter's own `put`, so a failure here (e.g. racing a `close`) is not
            // surfaced to anyone -- the session is simply leaked to the keeper/close path's
            // cleanup the next time it's observed, same as any session dropped by its caller.
            let _ = self.put(session).await;
        }
    }

    /// Hands `s` back. Delivers directly to the oldest live waiter if any; else appends to the
    /// idle list. Panics on double-put, per the pool's programmer-error contract.
    pub async fn put(&self, session: Arc<Session>) -> Result<()> {
        if self.state.is_closed() {
            return Err(ErrorKind::PoolClosed.into());
        }

        let session_id = session.id().to_string();
        let mut inner = self.state.inner.lock().await;

        if inner.idle.iter().any(|r| r.session.id() == session_id) {
            drop(inner);
            panic!("session {session_id} double-put into the pool");
        }
        if !inner.index.contains(&session_id) {
            drop(inner);
            panic!("session {session_id} put into a pool that never checked it out");
        }

        let mut to_deliver = session;
        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.tx.send(to_deliver) {
                Ok(()) => {
                    drop(inner);
                    self.state.events.put.emit(|| SessionPutEvent {
                        session_id,
                        delivered_to_waiter: true,
                    });
                    return Ok(());
                }
                Err(bounced) => to_deliver = bounced,
            }
        }

        if inner.idle.len() >= self.state.config.size_limit {
            inner.index.remove(&session_id);
            drop(inner);
            return Err(ErrorKind::PoolOverflow.into());
        }

        inner.idle.push_back(Record {
            session: to_deliver,
            touched: Instant::now(),
        });
        drop(inner);
        self.state.keeper_wake.notify_one();
        self.state.events.put.emit(|| SessionPutEvent {
            session_id,
            delivered_to_waiter: false,
        });
        Ok(())
    }

    /// Removes `session` from the idle list if present. If the keeper is mid-keepalive on it,
    /// waits for that round to finish before deciding. Returns `false` (never an error) if the
    /// session was deleted by the keeper in the meantime or is not idle for any other reason.
    pub async fn take(&self, session: &Arc<Session>) -> Result<bool> {
        loop {
            let mut inner = self.state.inner.lock().await;

            if let Some(pos) = inner.idle.iter().position(|r| r.session.id() == session.id()) {
                inner.idle.remove(pos);
                drop(inner);
                self.state.events.take.emit(|| SessionTakeEvent {
                    session_id: session.id().to_string(),
                    succeeded: true,
                });
                return Ok(true);
            }

            if !inner.index.contains(session.id()) {
                drop(inner);
                self.state.events.take.emit(|| SessionTakeEvent {
                    session_id: session.id().to_string(),
                    succeeded: false,
                });
                return Ok(false);
            }

            if inner.keepaliving.as_deref() == Some(session.id()) {
                drop(inner);
                self.state.keeper_done.notified().await;
                continue;
            }

            // Tracked, not idle, not mid-keepalive: checked out elsewhere.
            drop(inner);
            self.state.events.take.emit(|| SessionTakeEvent {
                session_id: session.id().to_string(),
                succeeded: false,
            });
            return Ok(false);
        }
    }

    /// Stops the keeper, drains the idle list (closing each session), wakes every waiter with
    /// [`ErrorKind::PoolClosed`], and rejects subsequent `put`. Idempotent.
    pub async fn close(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.shutdown.cancel();
        self.keeper.abort();

        let (idle, waiters) = {
            let mut inner = self.state.inner.lock().await;
            let idle = std::mem::take(&mut inner.idle);
            let waiters = std::mem::take(&mut inner.waiters);
            inner.index.clear();
            (idle, waiters)
        };

        // Dropping each waiter's sender (rather than sending anything) makes its `&mut rx` future
        // resolve to `Err`, which `wait_for_put` maps to `ErrorKind::PoolClosed`.
        drop(waiters);

        for record in idle {
            self.state.retire(record.session, RetireReason::PoolClosed).await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn idle_len(&self) -> usize {
        self.state.inner.lock().await.idle.len()
    }

    #[cfg(test)]
    pub(crate) async fn tracked_len(&self) -> usize {
        self.state.inner.lock().await.index.len()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use futures_util::FutureExt;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        balancer::BalancerPolicy,
        cluster::{Cluster, ClusterEventEmitters, StaticDiscovery},
        config::ClientConfig,
        endpoint::Endpoint,
        session::factory::test_support::CountingSessionFactory,
        transport::NoCredentials,
    };

    struct LoopbackTransport;

    #[async_trait::async_trait]
    impl crate::transport::WireTransport for LoopbackTransport {
        async fn dial(
            &self,
            _endpoint: &Endpoint,
            _timeout: Duration,
        ) -> Result<Box<dyn crate::transport::RawChannel>> {
            #[derive(Debug)]
            struct LoopbackChannel;

            #[async_trait::async_trait]
            impl crate::transport::RawChannel for LoopbackChannel {
                async fn invoke(
                    &self,
                    _method: &str,
                    _request: &[u8],
                    _params: crate::transport::OperationParams,
                ) -> Result<Vec<u8>> {
                    Ok(Vec::new())
                }
                async fn open_stream(
                    &self,
                    _method: &str,
                    _request: &[u8],
                ) -> Result<Box<dyn crate::transport::RawStream>> {
                    unreachable!("session pool tests never open a stream")
                }
                fn is_usable(&self) -> bool {
                    true
                }
            }

            Ok(Box::new(LoopbackChannel))
        }
    }

    async fn test_pool(size_limit: usize) -> SessionPool {
        let config = ClientConfig::builder()
            .endpoint("a:2135")
            .database("/local")
            .balancer(BalancerPolicy::Single)
            .discovery_interval(Duration::from_secs(3600))
            .build();
        let discovery = Arc::new(StaticDiscovery::new(vec![Endpoint::new("a:2135")]));
        let cluster = Arc::new(
            Cluster::new(
                config,
                Arc::new(LoopbackTransport),
                Arc::new(NoCredentials),
                discovery,
                ClusterEventEmitters::default(),
            )
            .await
            .unwrap(),
        );

        let mut pool_config = SessionPoolConfig::builder().size_limit(size_limit).build();
        pool_config.idle_threshold = None;

        SessionPool::new(
            pool_config,
            cluster,
            Arc::new(CountingSessionFactory::default()),
            SessionPoolEventEmitters::default(),
        )
    }

    #[tokio::test]
    async fn put_then_get_round_trips_the_same_session() {
        let pool = test_pool(1).await;
        let cancel = CancellationToken::new();

        let s = pool.get(&cancel).await.unwrap();
        let id = s.id().to_string();
        pool.put(s).await.unwrap();

        let s2 = pool.get(&cancel).await.unwrap();
        assert_eq!(s2.id(), id);
    }

    #[tokio::test]
    async fn double_put_panics() {
        let pool = test_pool(1).await;
        let cancel = CancellationToken::new();
        let s = pool.get(&cancel).await.unwrap();

        pool.put(s.clone()).await.unwrap();
        let result = std::panic::AssertUnwindSafe(pool.put(s))
            .catch_unwind()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn overflow_waiter_receives_exactly_the_put_session() {
        let pool = Arc::new(test_pool(1).await);
        let cancel = CancellationToken::new();

        let s = pool.get(&cancel).await.unwrap();
        let id = s.id().to_string();

        let pool2 = pool.clone();
        let cancel2 = CancellationToken::new();
        let waiter = tokio::spawn(async move { pool2.get(&cancel2).await });

        tokio::task::yield_now().await;
        pool.put(s).await.unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.id(), id);
    }

    #[tokio::test]
    async fn cancelled_waiter_that_already_received_a_session_returns_it() {
        let pool = Arc::new(test_pool(1).await);
        let cancel = CancellationToken::new();

        let s = pool.get(&cancel).await.unwrap();

        let pool2 = pool.clone();
        let waiter_cancel = CancellationToken::new();
        let waiter_cancel2 = waiter_cancel.clone();
        let waiter = tokio::spawn(async move { pool2.get(&waiter_cancel2).await });

        tokio::task::yield_now().await;
        // Cancel immediately after the put races with delivery: either the waiter wins the race
        // and must hand the session back, or the cancellation wins and the session lands in the
        // idle list via `abandon_wait`. Either way a subsequent `get` must succeed.
        pool.put(s).await.unwrap();
        waiter_cancel.cancel();
        let _ = waiter.await.unwrap();

        let again = pool.get(&cancel).await.unwrap();
        assert!(!again.id().is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_subsequent_operations() {
        let pool = test_pool(1).await;
        let cancel = CancellationToken::new();
        let s = pool.get(&cancel).await.unwrap();
        pool.put(s).await.unwrap();

        pool.close().await;
        pool.close().await;

        let err = pool.get(&cancel).await.unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::PoolClosed));
    }

    #[tokio::test]
    async fn size_limit_is_respected_under_concurrent_gets() {
        let pool = Arc::new(test_pool(2).await);
        let gets = (0..2).map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                pool.get(&cancel).await
            })
        });
        for result in futures::future::join_all(gets).await {
            result.unwrap().unwrap();
        }
        assert_eq!(pool.tracked_len().await, 2);
    }
}
