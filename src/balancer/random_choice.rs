//! Random-choice balancer: a fast path that picks one index uniformly at random, falling back to
//! a shuffled full scan under the same two-pass (banned-not-ok, then banned-ok) rule the
//! round-robin balancer uses.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;

use super::{is_ok_connection, Balancer, RefreshGate, RefreshSubscriber};
use crate::conn::Connection;

#[derive(Debug)]
pub(crate) struct RandomChoice {
    conns: Vec<Arc<Connection>>,
    refresh: RefreshGate,
    refresh_sub: RefreshSubscriber,
}

impl RandomChoice {
    pub(crate) fn new(conns: Vec<Arc<Connection>>) -> Self {
        let (refresh, refresh_sub) = RefreshGate::new();
        Self {
            conns,
            refresh,
            refresh_sub,
        }
    }
}

impl Balancer for RandomChoice {
    fn next(&self) -> Option<Arc<Connection>> {
        let conn_count = self.conns.len();
        if conn_count == 0 {
            return None;
        }

        // Fast path: a single uniform pick, only accepted if immediately usable and not banned.
        // This keeps the common case (a healthy cluster) allocation-free.
        let fast_index = rand::rng().random_range(0..conn_count);
        let fast_conn = &self.conns[fast_index];
        if is_ok_connection(fast_conn.state(), false) {
            self.refresh.check(0, conn_count);
            return Some(fast_conn.clone());
        }

        // Slow path: shuffle the full index set and scan it twice, same as round-robin.
        let mut order: Vec<usize> = (0..conn_count).collect();
        order.shuffle(&mut rand::rng());

        let mut failed_conns = 1usize; // the fast-path probe already failed
        for banned_is_ok in [false, true] {
            for &index in &order {
                let conn = &self.conns[index];
                if is_ok_connection(conn.state(), banned_is_ok) {
                    self.refresh.check(failed_conns, conn_count);
                    return Some(conn.clone());
                }
                failed_conns += 1;
            }
        }

        self.refresh.check(failed_conns, conn_count);
        None
    }

    fn create(&self, conns: Vec<Arc<Connection>>) -> Arc<dyn Balancer> {
        Arc::new(RandomChoice::new(conns))
    }

    fn refresh_signal(&self) -> RefreshSubscriber {
        self.refresh_sub.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::conn::test_support::{fake_connection, state_of};
    use crate::conn::ConnState;

    #[test]
    fn empty_snapshot_returns_none() {
        let rc = RandomChoice::new(vec![]);
        assert!(rc.next().is_none());
    }

    #[test]
    fn never_returns_banned_when_some_online_exist() {
        let mut conns: Vec<_> = (0..6).map(|i| fake_connection(i, ConnState::Online)).collect();
        conns[0] = fake_connection(0, ConnState::Banned);
        conns[1] = fake_connection(1, ConnState::Banned);
        let rc = RandomChoice::new(conns);

        for _ in 0..200 {
            let picked = rc.next().unwrap();
            assert_ne!(state_of(&picked), ConnState::Banned);
        }
    }

    #[test]
    fn all_banned_selectable_on_second_pass() {
        let conns: Vec<_> = (0..3).map(|i| fake_connection(i, ConnState::Banned)).collect();
        let rc = RandomChoice::new(conns);
        assert!(rc.next().is_some());
    }

    #[test]
    fn only_element_returned_outside_snapshot_never_happens() {
        let conns: Vec<_> = (0..5).map(|i| fake_connection(i, ConnState::Online)).collect();
        let rc = RandomChoice::new(conns.clone());
        for _ in 0..100 {
            let picked = rc.next().unwrap();
            assert!(conns.iter().any(|c| Arc::ptr_eq(c, &picked)));
        }
    }
}
