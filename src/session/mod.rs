//! The Session Pool: table-service session lifecycle (create/get/put/take/close) plus the
//! keepalive keeper that refreshes idle sessions before the server ages them out. See
//! `SPEC_FULL.md` §4.7 for the operation contract and §8 for the invariants this module's tests
//! exercise.

mod factory;
mod handle;
mod keeper;
pub(crate) mod pool;

pub use factory::SessionFactory;
pub use handle::Session;

pub use pool::{SessionPool, SessionPoolEventEmitters};
