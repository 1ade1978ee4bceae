use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

#[derive(Default)]
pub struct PeerCounters {
    pub admitted: AtomicU64,
    pub rejected: AtomicU64,
    pub operations_permitted: AtomicU64,
    pub operations_denied: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PeerSnapshot {
    pub admitted: u64,
    pub rejected: u64,
    pub operations_permitted: u64,
    pub operations_denied: u64,
}

/// Per-peer admission and authorization counters (§4.9). Kept separate from
/// the Reference Table and Transaction Layer so a deployment can expose
/// these without depending on `netmirror-service`'s internals.
#[derive(Clone, Default)]
pub struct Statistics {
    peers: Arc<RwLock<AHashMap<SocketAddr, Arc<PeerCounters>>>>,
}

impl Statistics {
    fn counters(&self, peer: SocketAddr) -> Arc<PeerCounters> {
        if let Some(existing) = self.peers.read().get(&peer) {
            return existing.clone();
        }
        self.peers.write().entry(peer).or_insert_with(|| Arc::new(PeerCounters::default())).clone()
    }

    pub fn record_admit(&self, peer: SocketAddr, admitted: bool) {
        let counters = self.counters(peer);
        let field = if admitted { &counters.admitted } else { &counters.rejected };
        field.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permit(&self, peer: SocketAddr, allowed: bool) {
        let counters = self.counters(peer);
        let field = if allowed {
            &counters.operations_permitted
        } else {
            &counters.operations_denied
        };
        field.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, peer: SocketAddr) -> PeerSnapshot {
        match self.peers.read().get(&peer) {
            Some(c) => PeerSnapshot {
                admitted: c.admitted.load(Ordering::Relaxed),
                rejected: c.rejected.load(Ordering::Relaxed),
                operations_permitted: c.operations_permitted.load(Ordering::Relaxed),
                operations_denied: c.operations_denied.load(Ordering::Relaxed),
            },
            None => PeerSnapshot::default(),
        }
    }

    pub fn known_peers(&self) -> Vec<SocketAddr> {
        self.peers.read().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_peer() {
        let stats = Statistics::default();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        stats.record_admit(peer, true);
        stats.record_admit(peer, true);
        stats.record_permit(peer, false);

        let snapshot = stats.snapshot(peer);
        assert_eq!(snapshot.admitted, 2);
        assert_eq!(snapshot.operations_denied, 1);
        assert_eq!(snapshot.operations_permitted, 0);
    }

    #[test]
    fn unknown_peer_snapshot_is_zeroed() {
        let stats = Statistics::default();
        let peer: SocketAddr = "127.0.0.1:2".parse().unwrap();
        assert_eq!(stats.snapshot(peer).admitted, 0);
    }
}
