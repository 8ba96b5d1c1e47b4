//! The `Single` balancer: holds zero or one connection and always returns it.

use std::sync::Arc;

use super::{Balancer, RefreshSubscriber};
use crate::conn::Connection;

#[derive(Debug)]
pub(crate) struct Single {
    conn: Option<Arc<Connection>>,
}

impl Single {
    /// Constructing this with more than one connection is a programmer error: a `Single`
    /// balancer is only ever selected for a bootstrap or single-node cluster configuration.
    pub(crate) fn new(conns: Vec<Arc<Connection>>) -> Self {
        assert!(
            conns.len() <= 1,
            "Single balancer constructed with {} connections, expected at most 1",
            conns.len()
        );
        Self {
            conn: conns.into_iter().next(),
        }
    }
}

impl Balancer for Single {
    fn next(&self) -> Option<Arc<Connection>> {
        self.conn.clone()
    }

    fn create(&self, conns: Vec<Arc<Connection>>) -> Arc<dyn Balancer> {
        Arc::new(Single::new(conns))
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
    fn empty_returns_none() {
        let single = Single::new(vec![]);
        assert!(single.next().is_none());
    }

    #[test]
    fn returns_the_one_connection_unconditionally() {
        let conn = fake_connection(0, ConnState::Banned);
        let single = Single::new(vec![conn.clone()]);
        assert!(Arc::ptr_eq(&single.next().unwrap(), &conn));
    }

    #[test]
    #[should_panic(expected = "Single balancer constructed with 2 connections")]
    fn more_than_one_connection_panics() {
        let conns = vec![
            fake_connection(0, ConnState::Online),
            fake_connection(1, ConnState::Online),
        ];
        let _ = Single::new(conns);
    }
}
