//! Context-pinned balancer: returns the connection for an endpoint address pinned on the calling
//! request, if one was given and it is present in this balancer's snapshot. Never participates
//! in the unpinned selection path and never raises a refresh signal of its own; it exists purely
//! as the first child tried by [`super::Composite`] so that a caller pinned to a specific node
//! (e.g. to read its own prior write) can bypass the usual policy.

use std::{collections::HashMap, sync::Arc};

use super::{Balancer, RefreshSubscriber};
use crate::conn::Connection;

#[derive(Debug)]
pub(crate) struct ContextPinned {
    by_address: HashMap<String, Arc<Connection>>,
}

impl ContextPinned {
    pub(crate) fn new(conns: Vec<Arc<Connection>>) -> Self {
        Self {
            by_address: conns
                .into_iter()
                .map(|c| (c.endpoint().address().to_string(), c))
                .collect(),
        }
    }
}

impl Balancer for ContextPinned {
    /// With no pin, this balancer never has an opinion; the composite falls through to its next
    /// child.
    fn next(&self) -> Option<Arc<Connection>> {
        None
    }

    fn next_pinned(&self, pin: Option<&str>) -> Option<Arc<Connection>> {
        pin.and_then(|address| self.by_address.get(address)).cloned()
    }

    fn create(&self, conns: Vec<Arc<Connection>>) -> Arc<dyn Balancer> {
        Arc::new(ContextPinned::new(conns))
    }

    fn refresh_signal(&self) -> RefreshSubscriber {
        RefreshSubscriber::never()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::conn::test_support::fake_connection;
    use crate::conn::ConnState;

    #[test]
    fn no_pin_returns_none() {
        let conns = vec![fake_connection(0, ConnState::Online)];
        let pinned = ContextPinned::new(conns);
        assert!(pinned.next().is_none());
        assert!(pinned.next_pinned(None).is_none());
    }

    #[test]
    fn pin_hit_returns_that_connection() {
        let conn = fake_connection(3, ConnState::Online);
        let address = conn.endpoint().address().to_string();
        let pinned = ContextPinned::new(vec![conn.clone()]);
        let picked = pinned.next_pinned(Some(&address)).unwrap();
        assert!(Arc::ptr_eq(&picked, &conn));
    }

    #[test]
    fn pin_miss_returns_none_so_composite_falls_through() {
        let conn = fake_connection(3, ConnState::Online);
        let pinned = ContextPinned::new(vec![conn]);
        assert!(pinned.next_pinned(Some("not-in-snapshot:2135")).is_none());
    }
}
