//! Round-robin balancer: an atomic counter, seeded randomly so the first nodes in the list don't
//! take a disproportionate share of load right after startup, probed twice per `next()` call
//! (first pass excludes banned connections, second pass allows them as a last resort).

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use rand::Rng;

use super::{is_ok_connection, Balancer, RefreshGate, RefreshSubscriber};
use crate::conn::Connection;

#[derive(Debug)]
pub(crate) struct RoundRobin {
    conns: Vec<Arc<Connection>>,
    next: AtomicU64,
    refresh: RefreshGate,
    refresh_sub: RefreshSubscriber,
}

impl RoundRobin {
    pub(crate) fn new(conns: Vec<Arc<Connection>>) -> Self {
        let (refresh, refresh_sub) = RefreshGate::new();
        Self {
            conns,
            next: AtomicU64::new(rand::rng().random::<u64>()),
            refresh,
            refresh_sub,
        }
    }
}

impl Balancer for RoundRobin {
    fn next(&self) -> Option<Arc<Connection>> {
        let conn_count = self.conns.len();
        if conn_count == 0 {
            return None;
        }

        let mut failed_conns = 0usize;
        for banned_is_ok in [false, true] {
            for _ in 0..conn_count {
                let index = (self.next.fetch_add(1, Ordering::Relaxed) as usize) % conn_count;
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
        Arc::new(RoundRobin::new(conns))
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
        let rr = RoundRobin::new(vec![]);
        assert!(rr.next().is_none());
    }

    #[test]
    fn fairness_over_many_calls() {
        let conns: Vec<_> = (0..4).map(|i| fake_connection(i, ConnState::Online)).collect();
        let rr = RoundRobin::new(conns.clone());

        let mut counts = [0usize; 4];
        for _ in 0..400 {
            let picked = rr.next().unwrap();
            let idx = conns.iter().position(|c| Arc::ptr_eq(c, &picked)).unwrap();
            counts[idx] += 1;
        }
        for c in counts {
            assert_eq!(c, 100);
        }
    }

    #[test]
    fn banned_connection_only_selected_on_second_pass() {
        let mut conns: Vec<_> = (0..4).map(|i| fake_connection(i, ConnState::Online)).collect();
        conns[1] = fake_connection(1, ConnState::Banned);
        let rr = RoundRobin::new(conns.clone());

        for _ in 0..400 {
            let picked = rr.next().unwrap();
            assert_ne!(state_of(&picked), ConnState::Banned);
        }
    }

    #[test]
    fn all_banned_selectable_on_second_pass() {
        let conns: Vec<_> = (0..2).map(|i| fake_connection(i, ConnState::Banned)).collect();
        let rr = RoundRobin::new(conns);
        assert!(rr.next().is_some());
    }
}
