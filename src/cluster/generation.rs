//! [`Generation`]: the immutable snapshot a [`super::Cluster`] holds behind a single lock,
//! swapped wholesale on every successful discovery round.

use std::{collections::HashMap, sync::Arc};

use crate::{balancer::Balancer, conn::Connection, endpoint::Endpoint};

/// One discovery round's worth of cluster state: the endpoint list as returned by discovery
/// (kept sorted, for diffing against the next round), the connections that back it keyed both
/// ways, and the balancer built over that connection set.
///
/// Immutable once constructed: a new discovery round always builds a brand new `Generation`
/// rather than mutating this one, so a reader who clones the `Arc` out of the cluster's lock is
/// guaranteed a self-consistent view even if discovery swaps in a new generation immediately
/// after.
pub(crate) struct Generation {
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) conns_by_address: HashMap<String, Arc<Connection>>,
    pub(crate) conns_by_node_id: HashMap<u32, Arc<Connection>>,
    pub(crate) balancer: Arc<dyn Balancer>,
}

impl Generation {
    /// The generation a [`super::Cluster`] starts with before its first discovery round.
    pub(crate) fn empty(balancer: Arc<dyn Balancer>) -> Self {
        Self {
            endpoints: Vec::new(),
            conns_by_address: HashMap::new(),
            conns_by_node_id: HashMap::new(),
            balancer,
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.conns_by_address.len()
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}
