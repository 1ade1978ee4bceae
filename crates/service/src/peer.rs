//! Peer record and import table (§3, §4.2): the remote-id -> Proxy mapping
//! kept per connected peer, plus the resolver that turns a decoded `Value`
//! into a `HostValue`, materializing Proxies for any `Reference` it finds.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use codec::{Opcode, Value};
use parking_lot::Mutex;

use crate::proxy::Proxy;
use crate::refs::HostValue;
use crate::transaction::{RetryPolicy, Transport, TransactionTable};

/// Per-peer remote-id -> Proxy mapping. Holds weak references so that a
/// Proxy with no remaining strong holders is reclaimed and, via its `Drop`
/// impl, sends a `RELEASE` to the peer (§9's recommended strategy).
#[derive(Debug)]
pub struct ImportTable {
    proxies: Mutex<HashMap<u64, Weak<Proxy>>>,
}

impl Default for ImportTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ImportTable {
    pub fn new() -> Self {
        Self {
            proxies: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the existing Proxy for `remote_id` if one is still live,
    /// otherwise constructs and caches a new one. At most one live Proxy
    /// per remote-id is ever handed out.
    #[allow(clippy::too_many_arguments)]
    pub fn import_from(
        &self,
        peer: Arc<PeerRecord>,
        remote_id: u64,
        transport: Arc<dyn Transport>,
        transactions: Arc<TransactionTable>,
        retry: RetryPolicy,
        local_exports: Arc<crate::refs::ExportTable>,
    ) -> Arc<Proxy> {
        let mut proxies = self.proxies.lock();
        if let Some(existing) = proxies.get(&remote_id).and_then(Weak::upgrade) {
            return existing;
        }
        let proxy = Arc::new(Proxy::new(
            peer,
            remote_id,
            transport,
            transactions,
            retry,
            local_exports,
        ));
        proxies.insert(remote_id, Arc::downgrade(&proxy));
        proxy
    }

    /// Drops the cached weak entry for `remote_id`, if any, without sending
    /// `RELEASE`. Used by [`drop_import`] below, ahead of its own send.
    pub fn forget(&self, remote_id: u64) {
        self.proxies.lock().remove(&remote_id);
    }
}

/// §9's `drop_import` capability: releases a Proxy the application no
/// longer wants to hold, deterministically and without waiting for the
/// last strong reference to drop. Forgets the cached entry first so a
/// concurrent `import_from` can't hand out the Proxy this is about to
/// release, then sends `RELEASE` directly (not through the Transaction
/// Layer — `RELEASE` carries no reply, per §4.3).
pub fn drop_import(peer: &Arc<PeerRecord>, remote_id: u64, transport: &dyn Transport) {
    peer.imports.forget(remote_id);
    if let Ok(bytes) = codec::Frame::new(0, Opcode::Release, Value::Reference(remote_id)).encode() {
        let _ = transport.send_datagram(peer.addr, bytes);
    }
}

/// Remote endpoint, its import table, and its last-seen timestamp. Created
/// on first `connect` or first inbound packet from a previously unknown
/// endpoint, subject to `Authenticator::admit_peer`.
#[derive(Debug)]
pub struct PeerRecord {
    pub addr: SocketAddr,
    pub imports: ImportTable,
    last_seen: Mutex<Instant>,
}

impl PeerRecord {
    pub fn new(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            imports: ImportTable::new(),
            last_seen: Mutex::new(Instant::now()),
        })
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }
}

fn contains_reference(value: &Value) -> bool {
    match value {
        Value::Reference(_) => true,
        Value::Sequence(items) => items.iter().any(contains_reference),
        Value::Mapping(entries) => entries
            .iter()
            .any(|(k, v)| contains_reference(k) || contains_reference(v)),
        _ => false,
    }
}

/// Converts a decoded wire `Value` into a `HostValue`, resolving any
/// `Reference` (including ones nested in sequences/mappings) into a Proxy
/// bound to `peer` via its import table. Values with no references pass
/// through untouched. `local_exports` is the export table of the Service
/// that will forward further arguments *through* any resolved Proxy.
#[allow(clippy::too_many_arguments)]
pub fn resolve_from_wire(
    value: Value,
    peer: &Arc<PeerRecord>,
    transactions: Arc<TransactionTable>,
    retry: RetryPolicy,
    transport: Arc<dyn Transport>,
    local_exports: Arc<crate::refs::ExportTable>,
) -> HostValue {
    resolve_inner(value, peer, &transactions, &retry, &transport, &local_exports)
}

fn resolve_inner(
    value: Value,
    peer: &Arc<PeerRecord>,
    transactions: &Arc<TransactionTable>,
    retry: &RetryPolicy,
    transport: &Arc<dyn Transport>,
    local_exports: &Arc<crate::refs::ExportTable>,
) -> HostValue {
    match value {
        Value::Reference(id) => HostValue::Object(peer.imports.import_from(
            peer.clone(),
            id,
            transport.clone(),
            transactions.clone(),
            retry.clone(),
            local_exports.clone(),
        )),
        Value::Sequence(items) => {
            if items.iter().any(contains_reference) {
                HostValue::List(
                    items
                        .into_iter()
                        .map(|v| resolve_inner(v, peer, transactions, retry, transport, local_exports))
                        .collect(),
                )
            } else {
                HostValue::Value(Value::Sequence(items))
            }
        }
        Value::Mapping(entries) => {
            if entries
                .iter()
                .any(|(k, v)| contains_reference(k) || contains_reference(v))
            {
                HostValue::Map(
                    entries
                        .into_iter()
                        .map(|(k, v)| {
                            (
                                resolve_inner(k, peer, transactions, retry, transport, local_exports),
                                resolve_inner(v, peer, transactions, retry, transport, local_exports),
                            )
                        })
                        .collect(),
                )
            } else {
                HostValue::Value(Value::Mapping(entries))
            }
        }
        other => HostValue::Value(other),
    }
}
