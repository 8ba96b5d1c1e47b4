//! Events emitted by the cluster and discovery repeater: init, get, endpoint set changes, and
//! close, plus the discovery RPC cycle itself.

use std::time::Duration;

use crate::endpoint::Endpoint;

#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ClusterInitEvent {
    pub bootstrap_endpoint: String,
}

#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ClusterGetEvent {
    pub endpoint: Option<Endpoint>,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Emitted once per endpoint added or removed by a discovery generation swap.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ClusterMembershipEvent {
    Inserted { endpoint: Endpoint },
    Removed { endpoint: Endpoint },
}

#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ClusterClosedEvent;

/// Events emitted by the discovery repeater around each discovery RPC invocation.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum DiscoveryEvent {
    Started,
    Succeeded { endpoint_count: usize, duration: Duration },
    Failed { duration: Duration, error: String },
}
