//! Composite balancer: an ordered list of `(filter, child)` pairs. `next`/`next_pinned` return
//! the first non-`None` child result; `create` rebuilds every child over the subset of the new
//! snapshot its filter admits; `refresh_signal` fans every child's signal into one.
//!
//! The canonical composite a [`crate::cluster::Cluster`] builds is
//! `[(accept-all, ContextPinned), (accept-all, <configured policy>)]`: the pin check always goes
//! first so a request asking for a specific endpoint is satisfied before falling through to the
//! ordinary load-balancing policy.

use std::sync::Arc;

use derive_where::derive_where;

use super::{Balancer, RefreshSubscriber};
use crate::conn::Connection;

/// A child's admission test, applied to the full snapshot before the child balancer is built.
pub(crate) type Filter = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

/// Filter that admits every connection; used by every built-in composite today, since none of
/// the built-in balancers partition the snapshot by anything other than state (which balancers
/// already handle internally via [`super::is_ok_connection`]).
pub(crate) fn accept_all() -> Filter {
    Arc::new(|_| true)
}

#[derive_where(Debug)]
pub(crate) struct Composite {
    /// Neither the filter closures nor the child trait objects are `Debug`; the child count is
    /// enough to make a `Composite` recognizable in a log line.
    #[derive_where(skip)]
    children: Vec<(Filter, Arc<dyn Balancer>)>,
}

impl Composite {
    pub(crate) fn new(children: Vec<(Filter, Arc<dyn Balancer>)>) -> Self {
        Self { children }
    }
}

impl Balancer for Composite {
    fn next(&self) -> Option<Arc<Connection>> {
        self.children.iter().find_map(|(_, child)| child.next())
    }

    fn next_pinned(&self, pin: Option<&str>) -> Option<Arc<Connection>> {
        self.children
            .iter()
            .find_map(|(_, child)| child.next_pinned(pin))
    }

    fn create(&self, conns: Vec<Arc<Connection>>) -> Arc<dyn Balancer> {
        let children = self
            .children
            .iter()
            .map(|(filter, child)| {
                let filtered: Vec<_> = conns.iter().filter(|c| filter(c)).cloned().collect();
                (filter.clone(), child.create(filtered))
            })
            .collect();
        Arc::new(Composite::new(children))
    }

    fn refresh_signal(&self) -> RefreshSubscriber {
        RefreshSubscriber::fanout(self.children.iter().map(|(_, child)| child.refresh_signal()).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::balancer::{ContextPinned, RoundRobin};
    use crate::conn::test_support::fake_connection;
    use crate::conn::ConnState;

    fn build(conns: Vec<Arc<Connection>>) -> Composite {
        Composite::new(vec![
            (accept_all(), Arc::new(ContextPinned::new(conns.clone()))),
            (accept_all(), Arc::new(RoundRobin::new(conns))),
        ])
    }

    #[test]
    fn falls_through_to_policy_without_pin() {
        let conns: Vec<_> = (0..3).map(|i| fake_connection(i, ConnState::Online)).collect();
        let composite = build(conns);
        assert!(composite.next().is_some());
    }

    #[test]
    fn pin_short_circuits_policy() {
        let conns: Vec<_> = (0..3).map(|i| fake_connection(i, ConnState::Online)).collect();
        let pinned_address = conns[1].endpoint().address().to_string();
        let composite = build(conns.clone());

        let picked = composite.next_pinned(Some(&pinned_address)).unwrap();
        assert!(Arc::ptr_eq(&picked, &conns[1]));
    }

    #[test]
    fn empty_snapshot_returns_none() {
        let composite = build(vec![]);
        assert!(composite.next().is_none());
        assert!(composite.next_pinned(Some("anything:2135")).is_none());
    }

    #[tokio::test]
    async fn refresh_fans_out_from_any_child() {
        let conns: Vec<_> = (0..4).map(|i| fake_connection(i, ConnState::Banned)).collect();
        let composite = build(conns);
        let mut sub = composite.refresh_signal();
        // All 4 connections are banned, so the round-robin child's first `next()` call alone
        // drives its failure count past half the snapshot and raises its signal.
        composite.next();
        tokio::time::timeout(std::time::Duration::from_millis(200), sub.wait())
            .await
            .expect("fanout should observe the child's raised signal");
    }
}
