//! Load-balancing policies over an immutable connection snapshot.
//!
//! A [`Balancer`] is purely a selection policy: [`Balancer::next`] is synchronous and pure over
//! the snapshot captured at [`Balancer::create`] time (see `SPEC_FULL.md` §9.1 for why `next` is
//! not async here, unlike some transitional drafts of this interface). The edge-triggered
//! "refresh needed" signal is a separate, explicit channel rather than part of `next`'s return
//! value, which keeps the hot selection path allocation-free.
//!
//! Implementations are not required to be internally synchronized beyond what their own state
//! needs (the cluster never calls into a balancer from two threads at once for the same
//! snapshot), matching the upstream contract that `Balancer` methods are "called synchronized."

mod composite;
mod context_pinned;
mod random_choice;
mod round_robin;
mod single;

use std::sync::Arc;

pub(crate) use composite::{accept_all, Composite, Filter};
pub(crate) use context_pinned::ContextPinned;
pub(crate) use random_choice::RandomChoice;
pub(crate) use round_robin::RoundRobin;
pub(crate) use single::Single;

use crate::conn::{Connection, ConnState};

/// Policy selector exposed on [`crate::config::ClientConfig`]. `Cluster` resolves this into a
/// concrete [`Balancer`] (wrapped in [`Composite`] alongside the context-pinned balancer) at
/// construction time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
#[non_exhaustive]
pub enum BalancerPolicy {
    RoundRobin,
    RandomChoice,
    /// Valid only for clusters with zero or one endpoint; panics otherwise.
    Single,
}

/// A connection is usable if it is `Online`, `Created`, or `Offline` (offline connections still
/// re-dial lazily on next use); `Banned` connections are usable only on a balancer's "banned is
/// ok" second pass, used as a last resort when nothing else is available.
pub(crate) fn is_ok_connection(state: ConnState, banned_is_ok: bool) -> bool {
    match state {
        ConnState::Online | ConnState::Created | ConnState::Offline => true,
        ConnState::Banned => banned_is_ok,
        ConnState::Unknown => false,
    }
}

/// Selects a connection from a fixed snapshot and signals when the snapshot has degraded enough
/// that the cluster should ask discovery for a fresh one.
pub(crate) trait Balancer: Send + Sync + std::fmt::Debug {
    /// Returns a usable connection from this balancer's snapshot, or `None` if the snapshot is
    /// empty or every connection in it is unusable.
    fn next(&self) -> Option<Arc<Connection>>;

    /// As [`Balancer::next`], but additionally given the endpoint address pinned on the calling
    /// request, if any. Every built-in balancer except [`ContextPinned`] ignores `pin` and
    /// defers to [`Balancer::next`]; [`Composite`] forwards it to whichever child it tries.
    fn next_pinned(&self, pin: Option<&str>) -> Option<Arc<Connection>> {
        let _ = pin;
        self.next()
    }

    /// Materializes a new balancer instance of the same kind over a fresh snapshot, as produced
    /// by a discovery generation swap.
    fn create(&self, conns: Vec<Arc<Connection>>) -> Arc<dyn Balancer>;

    /// A receiver that resolves exactly once, the first time this balancer observes that more
    /// than half of its connections are unusable. Edge-triggered: once the signal fires,
    /// subsequent `wait`s on the same subscriber resolve immediately.
    fn refresh_signal(&self) -> RefreshSubscriber;
}

/// Shared "more than half failed" edge-trigger, used by every built-in balancer except
/// [`Single`] and [`ContextPinned`] (which never have enough connections for the threshold to be
/// meaningful) and [`Composite`] (which fans the signal out across its children instead).
#[derive(Debug)]
pub(crate) struct RefreshGate {
    sender: tokio::sync::watch::Sender<bool>,
}

impl RefreshGate {
    pub(crate) fn new() -> (Self, RefreshSubscriber) {
        let (sender, receiver) = tokio::sync::watch::channel(false);
        (Self { sender }, RefreshSubscriber::Single(receiver))
    }

    /// Call after each `next()` probe loop with the number of probes that hit an unusable
    /// connection and the size of the snapshot. Raises the signal once `failed > total / 2`.
    pub(crate) fn check(&self, failed_conns: usize, conns_count: usize) {
        if conns_count == 0 || failed_conns <= conns_count / 2 {
            return;
        }
        // `send` is a no-op once the value is already `true`, and `watch::Sender` coalesces
        // redundant writes for free, so no extra guard against double-raising is needed here.
        let _ = self.sender.send(true);
    }
}

/// Subscriber side of a [`RefreshGate`] (or an equivalent one-shot signal owned by a balancer
/// that never raises it, like [`Single`]), or a fan-out over several of either. [`Composite`]
/// uses the `Fanout` variant so its `needRefresh` wakes when ANY child raises its own signal,
/// without spawning a watcher task per child: the fan-out is just a `select_all` evaluated
/// lazily inside `wait`, so there is nothing to leak when the caller drops the wait early on its
/// own cancellation.
#[derive(Debug, Clone)]
pub(crate) enum RefreshSubscriber {
    Single(tokio::sync::watch::Receiver<bool>),
    Fanout(Vec<RefreshSubscriber>),
}

impl RefreshSubscriber {
    /// A subscriber that never fires; used by balancers with too few connections for the
    /// half-failed heuristic to apply.
    pub(crate) fn never() -> Self {
        let (_sender, receiver) = tokio::sync::watch::channel(false);
        Self::Single(receiver)
    }

    /// Fans several subscribers out into one that fires as soon as any child does.
    pub(crate) fn fanout(children: Vec<RefreshSubscriber>) -> Self {
        Self::Fanout(children)
    }

    /// Resolves once the signal has been raised. [`crate::cluster::Cluster`] keeps exactly one
    /// of these awaited in a background task per generation, replacing (and aborting) it on every
    /// discovery round so the wait never outlives the snapshot it was built over.
    pub(crate) async fn wait(&mut self) {
        match self {
            Self::Single(rx) => loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Sender dropped without ever raising the signal (e.g. balancer replaced by
                    // a fresh generation); this subscriber will never fire.
                    std::future::pending::<()>().await;
                }
            },
            Self::Fanout(children) => {
                if children.is_empty() {
                    std::future::pending::<()>().await;
                    return;
                }
                let futs = children.iter_mut().map(|c| Box::pin(c.wait()));
                futures_util::future::select_all(futs).await;
            }
        }
    }
}

/// Builds the concrete balancer for a policy selection over an initial snapshot.
pub(crate) fn build(policy: BalancerPolicy, conns: Vec<Arc<Connection>>) -> Arc<dyn Balancer> {
    match policy {
        BalancerPolicy::RoundRobin => Arc::new(RoundRobin::new(conns)),
        BalancerPolicy::RandomChoice => Arc::new(RandomChoice::new(conns)),
        BalancerPolicy::Single => Arc::new(Single::new(conns)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ok_connection_rules() {
        assert!(is_ok_connection(ConnState::Online, false));
        assert!(is_ok_connection(ConnState::Created, false));
        assert!(is_ok_connection(ConnState::Offline, false));
        assert!(!is_ok_connection(ConnState::Banned, false));
        assert!(is_ok_connection(ConnState::Banned, true));
        assert!(!is_ok_connection(ConnState::Unknown, true));
    }
}
