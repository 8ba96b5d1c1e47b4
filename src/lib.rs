//! Client-side connection fabric and session pool for a distributed SQL/table database.
//!
//! This crate owns three things, described in full in `SPEC_FULL.md`: the [`cluster`] (endpoint
//! discovery, balancing, and connection lifecycle), the [`conn`] layer (dial, invoke, pessimize),
//! and the [`session`] pool (create/get/put/take/close plus the keepalive keeper). Everything
//! else -- the actual table-service RPCs, query execution, transactions -- is out of scope and is
//! expected to be built on top via the [`transport::WireTransport`], [`transport::CredentialsProvider`],
//! [`cluster::DiscoveryClient`], and [`session::SessionFactory`] collaborator traits.
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![cfg_attr(
    feature = "cargo-clippy",
    allow(
        clippy::unreadable_literal,
        clippy::cognitive_complexity,
        clippy::float_cmp,
        clippy::match_like_matches_macro,
        clippy::derive_partial_eq_without_eq
    )
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![cfg_attr(test, type_length_limit = "80000000")]

pub(crate) mod balancer;
pub(crate) mod cluster;
pub(crate) mod conn;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub(crate) mod runtime;
pub(crate) mod session;
pub mod transport;

pub use balancer::BalancerPolicy;
pub use cluster::{Cluster, ClusterEventEmitters, DiscoveryClient};
pub use conn::Connection;
pub use session::{Session, SessionFactory, SessionPool, SessionPoolEventEmitters};

/// A boxed future, used at the handler-registration boundary ([`event::EventHandler`]) where a
/// concrete future type can't be named.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
