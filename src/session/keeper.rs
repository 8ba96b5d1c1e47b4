//! The Keepalive Keeper: a single background task that owns a timer armed at the idle list's
//! oldest `touched` and periodically refreshes sessions before they age out server-side.
//!
//! Modeled as the state machine `SPEC_FULL.md` §9 calls for --
//! `{Sleeping(until), Keepaliving(session), Deleting(session)}` -- though in this implementation
//! the states are phases of one loop iteration rather than a literal enum, since every transition
//! here is driven synchronously by the previous step's outcome with no concurrent re-entry (there
//! is exactly one keeper task per pool).

use std::{sync::Arc, time::Instant};

use crate::{
    runtime::{self, AsyncJoinHandle},
    session::{
        pool::{PoolState, RetireReason},
        Session,
    },
};

/// Spawns the keeper task. Exits as soon as [`PoolState::shutdown`] fires; [`SessionPool::close`]
/// additionally aborts the handle so a keeper stuck mid-RPC doesn't delay `close`.
pub(crate) fn spawn(state: Arc<PoolState>) -> AsyncJoinHandle<()> {
    runtime::spawn(async move {
        loop {
            if state.is_closed() {
                return;
            }

            let Some(idle_threshold) = state.config.idle_threshold else {
                // Keeper disabled: park until the pool closes.
                state.shutdown.cancelled().await;
                return;
            };

            let wake_at = {
                let inner = state.inner.lock().await;
                inner.idle.front().map(|r| r.touched + idle_threshold)
            };

            match wake_at {
                None => {
                    tokio::select! {
                        _ = state.keeper_wake.notified() => {}
                        _ = state.shutdown.cancelled() => return,
                    }
                }
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline.into()) => {
                            run_round(&state).await;
                        }
                        _ = state.keeper_wake.notified() => {
                            // A `put` may have installed a new, earlier head; recompute.
                        }
                        _ = state.shutdown.cancelled() => return,
                    }
                }
            }
        }
    })
}

/// One keepalive round: pop the oldest idle session, keepalive it, and reinsert, delete, or
/// retry it depending on the outcome. Runs with the pool lock released for the RPC itself, per
/// the Design Notes' "readers never hold a lock across an RPC" rule.
async fn run_round(state: &Arc<PoolState>) {
    let record = {
        let mut inner = state.inner.lock().await;
        inner.idle.pop_front()
    };
    let Some(record) = record else {
        return;
    };

    let session = record.session;
    let started = Instant::now();
    {
        let mut inner = state.inner.lock().await;
        inner.keepaliving = Some(session.id().to_string());
    }

    let outcome = keepalive_once(state, &session).await;

    {
        let mut inner = state.inner.lock().await;
        inner.keepaliving = None;
    }
    state.keeper_done.notify_waiters();

    match outcome {
        Ok(()) => on_keepalive_success(state, session, started).await,
        Err(e) if e.is_bad_session() => {
            state.retire(session, RetireReason::BadSession).await;
        }
        Err(_) => {
            // Transient failure (deadline, transport blip): retry next tick without advancing
            // `touched`, so this session stays the keeper's next target.
            state.reinsert_idle(session, record.touched).await;
        }
    }
}

async fn keepalive_once(state: &Arc<PoolState>, session: &Session) -> crate::error::Result<()> {
    let cancel = crate::runtime::CancellationToken::new();
    let conn = state.cluster.get(&cancel, None).await?;
    runtime::timeout(
        state.config.create_session_timeout,
        state.factory.keep_alive_session(&conn, session),
    )
    .await?
}

async fn on_keepalive_success(state: &Arc<PoolState>, session: Arc<Session>, started: Instant) {
    let (aged_out, would_starve) = {
        let mut inner = state.inner.lock().await;
        let count = inner.keepalive_counts.entry(session.id().to_string()).or_insert(0);
        *count += 1;
        let aged_out = *count >= state.config.idle_keep_alive_threshold;
        let would_starve =
            inner.index.len().saturating_sub(1) < state.config.keep_alive_min_size;
        (aged_out, would_starve)
    };

    if aged_out && !would_starve {
        state.retire(session, RetireReason::AgedOut).await;
        return;
    }

    // `touched` is captured at round start, not completion: a `Put` that lands mid-round always
    // observes a later wall-clock time than this session's round start, so reinserting with the
    // round-start timestamp is what keeps this session correctly ordered as the older of the two
    // once both are idle again (see `reinsert_idle`'s doc comment for why tail-insertion alone
    // isn't safe here).
    state.reinsert_idle(session, started).await;
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        balancer::BalancerPolicy,
        cluster::{Cluster, ClusterEventEmitters, StaticDiscovery},
        config::{ClientConfig, SessionPoolConfig},
        endpoint::Endpoint,
        runtime::CancellationToken,
        session::{
            factory::test_support::{CountingSessionFactory, ScriptedSessionFactory},
            pool::{SessionPool, SessionPoolEventEmitters},
        },
        transport::NoCredentials,
    };

    #[derive(Debug)]
    struct LoopbackTransport;

    #[async_trait::async_trait]
    impl crate::transport::WireTransport for LoopbackTransport {
        async fn dial(
            &self,
            _endpoint: &Endpoint,
            _timeout: Duration,
        ) -> crate::error::Result<Box<dyn crate::transport::RawChannel>> {
            #[derive(Debug)]
            struct LoopbackChannel;

            #[async_trait::async_trait]
            impl crate::transport::RawChannel for LoopbackChannel {
                async fn invoke(
                    &self,
                    _method: &str,
                    _request: &[u8],
                    _params: crate::transport::OperationParams,
                ) -> crate::error::Result<Vec<u8>> {
                    Ok(Vec::new())
                }
                async fn open_stream(
                    &self,
                    _method: &str,
                    _request: &[u8],
                ) -> crate::error::Result<Box<dyn crate::transport::RawStream>> {
                    unreachable!()
                }
                fn is_usable(&self) -> bool {
                    true
                }
            }

            Ok(Box::new(LoopbackChannel))
        }
    }

    async fn test_pool(idle_threshold: Duration) -> SessionPool {
        test_pool_with_factory(idle_threshold, Arc::new(CountingSessionFactory::default())).await
    }

    async fn test_pool_with_factory(
        idle_threshold: Duration,
        factory: Arc<dyn crate::session::SessionFactory>,
    ) -> SessionPool {
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

        let mut pool_config = SessionPoolConfig::builder().size_limit(2).build();
        pool_config.idle_threshold = Some(idle_threshold);

        SessionPool::new(pool_config, cluster, factory, SessionPoolEventEmitters::default())
    }

    #[tokio::test(start_paused = true)]
    async fn reordering_preserves_ascending_touched_across_a_stalled_round() {
        let pool = test_pool(Duration::from_secs(4)).await;
        let cancel = CancellationToken::new();

        let s1 = pool.get(&cancel).await.unwrap();
        let s1_id = s1.id().to_string();
        pool.put(s1).await.unwrap();

        // Let the keeper's timer fire on s1 and start (the counting factory's keepalive completes
        // instantly, so by the time we advance further it has already run to completion and
        // reinserted s1 with `touched` pinned at this round-start instant).
        tokio::time::advance(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;

        let s2 = pool.get(&cancel).await.unwrap();
        pool.put(s2).await.unwrap();

        let oldest = pool.get(&cancel).await.unwrap();
        assert_eq!(oldest.id(), s1_id, "the keepalived session should remain the oldest");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_keep_alive_threshold_ages_out_a_session() {
        let pool = test_pool(Duration::from_millis(10)).await;
        let cancel = CancellationToken::new();

        let s = pool.get(&cancel).await.unwrap();
        let id = s.id().to_string();
        pool.put(s).await.unwrap();

        for _ in 0..1100 {
            tokio::time::advance(Duration::from_millis(10)).await;
            tokio::task::yield_now().await;
        }

        let replacement = pool.get(&cancel).await.unwrap();
        assert_ne!(replacement.id(), id, "the original session should have aged out");
    }

    #[tokio::test(start_paused = true)]
    async fn bad_session_is_deleted_instead_of_recycled() {
        let factory = Arc::new(ScriptedSessionFactory::default());
        let pool = test_pool_with_factory(Duration::from_secs(1), factory.clone()).await;
        let cancel = CancellationToken::new();

        let s = pool.get(&cancel).await.unwrap();
        let id = s.id().to_string();
        factory.fail_keepalive_for(id.clone());
        pool.put(s).await.unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        let replacement = pool.get(&cancel).await.unwrap();
        assert_ne!(replacement.id(), id, "a BadSession keepalive must delete, not recycle");
        assert!(factory.deleted.load(std::sync::atomic::Ordering::SeqCst));
    }
}
