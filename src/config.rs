//! The configuration surface consumed by the connection fabric and session pool.

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::balancer::BalancerPolicy;

/// Upper bound on [`crate::cluster::Cluster::get`], regardless of any looser deadline the caller
/// supplied. Mirrors the original driver's `MaxGetConnTimeout` constant.
pub const MAX_GET_CONN_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECTION_TTL: Duration = Duration::from_secs(600);

/// Top-level client configuration.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ClientConfig {
    /// Bootstrap discovery endpoint, e.g. `"ydb.example.com:2135"`.
    #[builder(setter(into))]
    pub endpoint: String,

    /// Tenant/database path. Opaque to the connection fabric.
    #[builder(setter(into))]
    pub database: String,

    /// Whether transport channels should be dialed over TLS.
    #[builder(default = true)]
    pub secure: bool,

    /// Bound on establishing the initial connection to a transport channel.
    #[builder(default = DEFAULT_DIAL_TIMEOUT)]
    pub dial_timeout: Duration,

    /// A channel that goes unused for this long is closed; the connection re-dials lazily on
    /// next use.
    #[builder(default = DEFAULT_CONNECTION_TTL)]
    pub connection_ttl: Duration,

    /// Whole-call bound applied to every `Connection::invoke`/`new_stream`.
    #[builder(default, setter(strip_option))]
    pub request_timeout: Option<Duration>,

    /// Server-side bound encoded onto the request itself, independent of `request_timeout`.
    /// Carried to the transport per call via [`crate::transport::OperationParams`].
    #[builder(default, setter(strip_option))]
    pub operation_timeout: Option<Duration>,

    /// Server-side bound after which the server should cancel (rather than merely time out) the
    /// operation and attempt to roll back any partial work. Carried to the transport per call via
    /// [`crate::transport::OperationParams`].
    #[builder(default, setter(strip_option))]
    pub operation_cancel_after: Option<Duration>,

    /// Lifetime bound applied to streaming calls.
    #[builder(default, setter(strip_option))]
    pub stream_timeout: Option<Duration>,

    /// Load-balancing policy used to select a connection from the cluster snapshot.
    #[builder(default = BalancerPolicy::RandomChoice)]
    pub balancer: BalancerPolicy,

    /// gRPC-equivalent status codes that must NOT pessimize the connection they occurred on, even
    /// though they originated as a transport-level failure.
    #[builder(default)]
    pub exclude_codes_for_pessimization: Vec<i32>,

    /// Interval between automatic discovery refreshes. `None` disables the periodic repeater;
    /// `Force()` still works on demand.
    #[builder(default = Some(DEFAULT_DISCOVERY_INTERVAL), setter(strip_option))]
    pub discovery_interval: Option<Duration>,

    /// Session pool configuration.
    #[builder(default)]
    pub session_pool: SessionPoolConfig,
}

/// Configuration specific to the session pool ([`crate::session::pool::SessionPool`]).
#[derive(Debug, Clone, TypedBuilder)]
pub struct SessionPoolConfig {
    /// Maximum number of sessions the pool will track at once, idle or checked out.
    #[builder(default = 50)]
    pub size_limit: usize,

    /// How long a session may sit idle before the keeper attempts a keepalive RPC on it. `None`
    /// (or zero) disables the keeper entirely.
    #[builder(default = Some(Duration::from_secs(5 * 60)), setter(strip_option))]
    pub idle_threshold: Option<Duration>,

    /// Maximum number of consecutive successful keepalives before a session is aged out and
    /// deleted, bounding unbounded session lifetime.
    #[builder(default = 1000)]
    pub idle_keep_alive_threshold: u32,

    /// The keeper will not delete sessions if doing so would drop the pool below this many
    /// tracked sessions, regardless of age.
    #[builder(default = 0)]
    pub keep_alive_min_size: usize,

    /// Bound on the round-trip used to create a brand new session, both for explicit `Create`
    /// calls and for `Get` calls that must create to satisfy a miss.
    #[builder(default = Duration::from_secs(5))]
    pub create_session_timeout: Duration,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        SessionPoolConfig::builder().build()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn session_pool_defaults_are_sane() {
        let cfg = SessionPoolConfig::default();
        assert!(cfg.size_limit > 0);
        assert!(cfg.idle_threshold.is_some());
    }

    #[test]
    fn client_config_requires_endpoint_and_database() {
        let cfg = ClientConfig::builder()
            .endpoint("localhost:2135")
            .database("/local")
            .build();
        assert_eq!(cfg.endpoint, "localhost:2135");
        assert_eq!(cfg.discovery_interval, Some(DEFAULT_DISCOVERY_INTERVAL));
    }
}
