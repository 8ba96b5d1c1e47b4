//! The Discovery Repeater: a single background task that periodically (and on demand) invokes
//! the discovery RPC collaborator and installs a new [`super::generation::Generation`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{endpoint::Endpoint, error::Result};

/// The discovery RPC collaborator named in the external-interfaces contract: returns the full
/// current endpoint list. Ordering is the server's; [`super::diff::diff`] sorts locally before
/// diffing, so this trait makes no ordering promise of its own.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Perform one discovery round-trip.
    async fn discover(&self) -> Result<Vec<Endpoint>>;
}

/// Handle to the running repeater task. `force` wakes the task immediately; overlapping forces
/// before the task gets a chance to run coalesce into a single extra round, since the channel
/// backing it has capacity 1 and a `Force` that finds it already full is a no-op.
#[derive(Clone)]
pub(crate) struct RepeaterHandle {
    force_tx: mpsc::Sender<()>,
}

impl RepeaterHandle {
    /// Wake the repeater immediately instead of waiting for its next interval tick.
    pub(crate) fn force(&self) {
        // `try_send` rather than `send`: a full channel means a force is already pending, which
        // is exactly the coalescing behavior the repeater contract asks for.
        let _ = self.force_tx.try_send(());
    }
}

/// Spawns the repeater task. `refresh` is called once per tick (interval or forced); the task
/// exits, dropping `refresh` and any state it closed over, when its
/// [`crate::runtime::AsyncJoinHandle`] is aborted or dropped.
pub(crate) fn spawn<F, Fut>(
    interval: Option<Duration>,
    mut refresh: F,
) -> (RepeaterHandle, crate::runtime::AsyncJoinHandle<()>)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let (force_tx, mut force_rx) = mpsc::channel(1);
    let handle = RepeaterHandle { force_tx };

    let join = crate::runtime::spawn(async move {
        let mut ticker = interval.map(tokio::time::interval);
        loop {
            match &mut ticker {
                Some(ticker) => {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        got = force_rx.recv() => {
                            if got.is_none() {
                                return;
                            }
                        }
                    }
                }
                None => {
                    // No periodic interval configured: the task only ever wakes on an explicit
                    // `Force()`.
                    match force_rx.recv().await {
                        Some(()) => {}
                        None => return,
                    }
                }
            }
            refresh().await;
        }
    });

    (handle, join)
}

/// A [`DiscoveryClient`] that always returns a fixed endpoint list; used by `Single`-balancer
/// bootstraps and in tests that don't want a real discovery round.
pub(crate) struct StaticDiscovery {
    endpoints: Vec<Endpoint>,
}

impl StaticDiscovery {
    pub(crate) fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl DiscoveryClient for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<Endpoint>> {
        Ok(self.endpoints.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn force_wakes_the_task_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let (handle, _join) = spawn(None, move || {
            let count = count2.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        handle.force();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_forces_coalesce() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let (handle, _join) = spawn(None, move || {
            let count = count2.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        // All three calls land before the repeater task is ever polled, so only the first one
        // finds room in the capacity-1 force channel; the rest are dropped as redundant wake-ups
        // for the one round that is about to run.
        handle.force();
        handle.force();
        handle.force();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
