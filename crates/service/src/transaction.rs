//! Transaction Layer (§4.3, §5): tid allocation, the waiter map, retry with
//! doubling backoff, and the reply cache that makes duplicate delivery
//! idempotent. Pure and synchronous — the actual socket send is supplied by
//! whoever embeds this crate, through [`Transport`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use codec::{Frame, Opcode, Value};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::Error;

/// Sends a single already-framed datagram to a peer. Implemented by the
/// socket layer that embeds this crate (see the `sdk` crate); never called
/// with the core's locks held.
pub trait Transport: Send + Sync {
    fn send_datagram(&self, peer: SocketAddr, bytes: Vec<u8>) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_interval: Duration::from_millis(200),
        }
    }
}

struct WaiterSlot {
    reply: Mutex<Option<Result<Value, Error>>>,
    condvar: Condvar,
}

/// The global waiter map keyed by (peer, tid), plus tid allocation.
pub struct TransactionTable {
    next_tid: AtomicU32,
    waiters: Mutex<HashMap<(SocketAddr, u32), Arc<WaiterSlot>>>,
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            next_tid: AtomicU32::new(1),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    fn alloc_tid(&self) -> u32 {
        loop {
            let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
            if tid != 0 {
                return tid;
            }
        }
    }

    /// Sends `opcode`/`payload` to `peer`, blocks the calling thread on a
    /// condition variable until a matching reply arrives or all retries are
    /// exhausted, and returns the decoded result.
    pub fn request(
        &self,
        transport: &dyn Transport,
        peer: SocketAddr,
        opcode: Opcode,
        payload: Value,
        policy: &RetryPolicy,
    ) -> Result<Value, Error> {
        let tid = self.alloc_tid();
        let slot = Arc::new(WaiterSlot {
            reply: Mutex::new(None),
            condvar: Condvar::new(),
        });
        self.waiters.lock().insert((peer, tid), slot.clone());

        let frame = Frame::new(tid, opcode, payload);
        let bytes = frame.encode()?;

        let send = |bytes: &[u8]| {
            transport
                .send_datagram(peer, bytes.to_vec())
                .map_err(|e| Error::PeerUnreachable(e.to_string()))
        };

        send(&bytes)?;

        let mut interval = policy.base_interval;
        let mut attempt = 0u32;
        let outcome = loop {
            let mut guard = slot.reply.lock();
            if guard.is_none() {
                let result = self.wait_with_timeout(&slot.condvar, &mut guard, interval);
                let _ = result;
            }
            if let Some(reply) = guard.take() {
                break reply;
            }
            drop(guard);

            if attempt >= policy.retries {
                break Err(Error::Timeout);
            }
            attempt += 1;
            interval *= 2;
            if let Err(e) = send(&bytes) {
                break Err(e);
            }
        };

        self.waiters.lock().remove(&(peer, tid));
        outcome
    }

    fn wait_with_timeout(
        &self,
        condvar: &Condvar,
        guard: &mut MutexGuard<'_, Option<Result<Value, Error>>>,
        timeout: Duration,
    ) -> bool {
        !condvar.wait_for(guard, timeout).timed_out()
    }

    /// Matches an inbound reply frame to its waiter, waking the blocked
    /// caller. Returns `false` if the tid is unknown (a reply for an
    /// unknown tid is dropped, per §4.6 failure semantics).
    pub fn complete(&self, peer: SocketAddr, tid: u32, result: Result<Value, Error>) -> bool {
        let slot = self.waiters.lock().get(&(peer, tid)).cloned();
        match slot {
            Some(slot) => {
                *slot.reply.lock() = Some(result);
                slot.condvar.notify_all();
                true
            }
            None => false,
        }
    }

    /// Wakes every outstanding waiter with `ServiceStopped`, used by
    /// `Service::stop`.
    pub fn cancel_all(&self) {
        let waiters = self.waiters.lock();
        for slot in waiters.values() {
            *slot.reply.lock() = Some(Err(Error::ServiceStopped));
            slot.condvar.notify_all();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.waiters.lock().len()
    }
}

/// Short-lived cache of already-computed replies, keyed by (peer, tid), so
/// a retransmitted request is answered without re-executing the operation.
pub struct ReplyCache {
    entries: Mutex<HashMap<(SocketAddr, u32), (Vec<u8>, Instant)>>,
    ttl: Duration,
}

impl ReplyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, peer: SocketAddr, tid: u32) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        entries.retain(|_, (_, at)| at.elapsed() < self.ttl);
        entries.get(&(peer, tid)).map(|(bytes, _)| bytes.clone())
    }

    pub fn insert(&self, peer: SocketAddr, tid: u32, bytes: Vec<u8>) {
        self.entries
            .lock()
            .insert((peer, tid), (bytes, Instant::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    struct LoopbackTransport {
        sent: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    }

    impl Transport for LoopbackTransport {
        fn send_datagram(&self, peer: SocketAddr, bytes: Vec<u8>) -> std::io::Result<()> {
            let _ = self.sent.send((peer, bytes));
            Ok(())
        }
    }

    #[test]
    fn reply_wakes_the_matching_waiter() {
        let table = Arc::new(TransactionTable::new());
        let (tx, rx) = mpsc::channel();
        let transport = LoopbackTransport { sent: tx };
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        let table2 = table.clone();
        let handle = thread::spawn(move || {
            table2.request(
                &transport,
                peer,
                Opcode::Hello,
                Value::Nil,
                &RetryPolicy::default(),
            )
        });

        let (_peer, bytes) = rx.recv().unwrap();
        let frame = Frame::decode(&bytes).unwrap();
        table.complete(peer, frame.tid, Ok(Value::Nil));

        assert_eq!(handle.join().unwrap().unwrap(), Value::Nil);
    }

    #[test]
    fn unmatched_reply_is_dropped() {
        let table = TransactionTable::new();
        let peer: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        assert!(!table.complete(peer, 123, Ok(Value::Nil)));
    }

    #[test]
    fn reply_cache_expires_after_ttl() {
        let cache = ReplyCache::new(Duration::from_millis(10));
        let peer: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        cache.insert(peer, 1, vec![1, 2, 3]);
        assert!(cache.get(peer, 1).is_some());
        thread::sleep(Duration::from_millis(30));
        assert!(cache.get(peer, 1).is_none());
    }
}
