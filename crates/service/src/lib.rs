//! Reference table, transaction layer, dispatcher, proxy and authenticator
//! engine for Network Object Mirroring. This crate is synchronous and does
//! no socket I/O of its own — it is driven by a transport supplied by the
//! embedding crate (see `netmirror-sdk`), mirroring how the dispatch/session
//! logic this crate is modeled on stays independent of any particular
//! listener.

pub mod authenticator;
pub mod dispatcher;
mod error;
mod peer;
mod proxy;
mod refs;
pub mod transaction;

pub use authenticator::{Authenticator, DefaultAuthenticator, OperationContext};
pub use codec::{Frame, Opcode, Value};
pub use error::Error;
pub use peer::{resolve_from_wire, PeerRecord};
pub use proxy::Proxy;
pub use refs::{encode_host_value, ExportTable, HostValue, RemoteObject};
pub use transaction::{ReplyCache, RetryPolicy, Transport, TransactionTable};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use codec::Opcode as WireOpcode;
use parking_lot::RwLock;

/// Ties the Reference Table, Transaction Layer, and Authenticator together
/// into the sync engine a `Service` (in `netmirror-sdk`) drives. Roughly
/// the "~10%" Service component of the overall design, minus the socket and
/// worker pool, which live with the transport.
pub struct Core<A: Authenticator> {
    pub exports: Arc<ExportTable>,
    pub transactions: Arc<TransactionTable>,
    pub reply_cache: ReplyCache,
    pub authenticator: A,
    pub retry: RetryPolicy,
    peers: RwLock<HashMap<SocketAddr, Arc<PeerRecord>>>,
}

impl<A: Authenticator> Core<A> {
    pub fn new(authenticator: A, retry: RetryPolicy, reply_cache_ttl: Duration) -> Self {
        Self {
            exports: Arc::new(ExportTable::new()),
            transactions: Arc::new(TransactionTable::new()),
            reply_cache: ReplyCache::new(reply_cache_ttl),
            authenticator,
            retry,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a new export, optionally under a public name.
    pub fn register(&self, name: Option<&str>, object: Arc<dyn RemoteObject>) -> u64 {
        match name {
            Some(name) => self.exports.register(name, object),
            None => self.exports.export(object),
        }
    }

    pub fn list_names(&self) -> Vec<String> {
        self.exports.list_names()
    }

    pub fn resolve_name(&self, name: &str) -> Option<u64> {
        self.exports.resolve_name(name)
    }

    /// Gets or creates the peer record for `addr`, consulting
    /// `admit_peer` for endpoints seen for the first time.
    pub fn peer(&self, addr: SocketAddr) -> Option<Arc<PeerRecord>> {
        if let Some(existing) = self.peers.read().get(&addr) {
            return Some(existing.clone());
        }
        if !self.authenticator.admit_peer(addr) {
            return None;
        }
        let mut peers = self.peers.write();
        Some(peers.entry(addr).or_insert_with(|| PeerRecord::new(addr)).clone())
    }

    pub fn connect(&self, addr: SocketAddr) -> Result<Arc<PeerRecord>, Error> {
        self.peer(addr).ok_or(Error::AccessDenied)
    }

    /// Resolves a remote id on `peer` into a Proxy, for use once a caller
    /// already has the id (e.g. from decoding a `RESOLVE` reply).
    pub fn import_from(
        &self,
        peer: &Arc<PeerRecord>,
        remote_id: u64,
        transport: Arc<dyn Transport>,
    ) -> Arc<Proxy> {
        peer.imports.import_from(
            peer.clone(),
            remote_id,
            transport,
            self.transactions.clone(),
            self.retry.clone(),
            self.exports.clone(),
        )
    }

    /// Deterministically releases an imported Proxy (§9's `drop_import`
    /// capability): forgets the cached entry on `peer`'s import table and
    /// sends `RELEASE` immediately, rather than waiting for the Proxy's
    /// last strong reference to drop via its own best-effort `Drop` impl.
    pub fn drop_import(&self, peer: &Arc<PeerRecord>, remote_id: u64, transport: Arc<dyn Transport>) {
        peer::drop_import(peer, remote_id, transport.as_ref());
    }

    /// Fast path for the receiver: matches an inbound `REPLY_OK`/`REPLY_ERR`
    /// frame to its waiter. Never touches the dispatcher or any lock beyond
    /// the waiter map.
    pub fn handle_reply(&self, peer_addr: SocketAddr, frame: Frame) {
        let result = match frame.opcode {
            WireOpcode::ReplyErr => match frame.payload {
                Value::Sequence(parts) if parts.len() == 2 => {
                    let kind = match &parts[0] {
                        Value::TextString(s) => s.clone(),
                        _ => "RemoteError".to_string(),
                    };
                    let message = match &parts[1] {
                        Value::TextString(s) => s.clone(),
                        _ => String::new(),
                    };
                    Err(Error::RemoteError { kind, message })
                }
                _ => Err(Error::RemoteError {
                    kind: "RemoteError".to_string(),
                    message: String::new(),
                }),
            },
            _ => Ok(frame.payload),
        };
        self.transactions.complete(peer_addr, frame.tid, result);
    }

    /// Handles a non-reply inbound datagram: consults the reply cache,
    /// admits the peer, dispatches, caches and returns the reply bytes to
    /// send back. `RELEASE` carries no reply and is handled without
    /// touching the dispatcher or the reply cache.
    pub fn handle_request(
        &self,
        peer_addr: SocketAddr,
        frame: Frame,
        transport: Arc<dyn Transport>,
    ) -> Option<Vec<u8>> {
        if frame.opcode == WireOpcode::Release {
            if let Ok(id) = dispatcher::expect_reference_payload(&frame.payload) {
                self.exports.release(id);
            }
            return None;
        }

        if let Some(cached) = self.reply_cache.get(peer_addr, frame.tid) {
            return Some(cached);
        }

        let peer = self.peer(peer_addr)?;
        peer.touch();

        let reply_frame = dispatcher::dispatch(self, &peer, &frame, transport);
        let reply_bytes = reply_frame.encode().ok()?;
        self.reply_cache.insert(peer_addr, frame.tid, reply_bytes.clone());
        Some(reply_bytes)
    }

    /// Wakes every outstanding waiter with `ServiceStopped`.
    pub fn stop(&self) {
        self.transactions.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingTransport {
        sent: StdMutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
            })
        }
    }

    impl Transport for RecordingTransport {
        fn send_datagram(&self, peer: SocketAddr, bytes: Vec<u8>) -> std::io::Result<()> {
            self.sent.lock().unwrap().push((peer, bytes));
            Ok(())
        }
    }

    struct Greeter;
    impl RemoteObject for Greeter {
        fn call(
            &self,
            args: Vec<HostValue>,
            _kwargs: Vec<(String, HostValue)>,
        ) -> Result<HostValue, Error> {
            let name = match args.first() {
                Some(HostValue::Value(Value::TextString(s))) => s.clone(),
                _ => return Err(Error::MalformedValue { offset: 0 }),
            };
            Ok(HostValue::Value(Value::TextString(format!("hi {name}"))))
        }
    }

    struct Mapping;
    impl RemoteObject for Mapping {
        fn get_attr(&self, name: &str) -> Result<HostValue, Error> {
            match name {
                "a" => Ok(HostValue::Value(Value::SignedInt(1))),
                "b" => Ok(HostValue::Value(Value::Sequence(vec![
                    Value::SignedInt(2),
                    Value::SignedInt(3),
                ]))),
                _ => Err(Error::NotFound),
            }
        }

        fn get_item(&self, key: HostValue) -> Result<HostValue, Error> {
            self.get_attr(match &key {
                HostValue::Value(Value::TextString(s)) => s,
                _ => return Err(Error::NotFound),
            })
        }
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn list_and_resolve_scenario() {
        let core: Core<DefaultAuthenticator> =
            Core::new(DefaultAuthenticator::default(), RetryPolicy::default(), Duration::from_secs(1));
        core.register(Some("m"), Arc::new(Mapping));
        let transport = RecordingTransport::new();

        let list_frame = Frame::new(1, WireOpcode::List, Value::Nil);
        let reply = core
            .handle_request(addr(1), list_frame, transport.clone())
            .unwrap();
        let reply = Frame::decode(&reply).unwrap();
        assert_eq!(reply.payload, Value::Sequence(vec![Value::TextString("m".into())]));

        let resolve_frame = Frame::new(2, WireOpcode::Resolve, Value::TextString("m".into()));
        let reply = core
            .handle_request(addr(1), resolve_frame, transport.clone())
            .unwrap();
        let reply = Frame::decode(&reply).unwrap();
        let id = match reply.payload {
            Value::Reference(id) => id,
            _ => panic!("expected reference"),
        };

        let getattr_frame = Frame::new(
            3,
            WireOpcode::GetAttr,
            Value::Sequence(vec![Value::Reference(id), Value::TextString("a".into())]),
        );
        let reply = core.handle_request(addr(1), getattr_frame, transport).unwrap();
        let reply = Frame::decode(&reply).unwrap();
        assert_eq!(reply.payload, Value::SignedInt(1));
    }

    #[test]
    fn underscore_attrs_are_denied_by_default() {
        let core: Core<DefaultAuthenticator> =
            Core::new(DefaultAuthenticator::default(), RetryPolicy::default(), Duration::from_secs(1));
        let id = core.register(None, Arc::new(Mapping));
        let transport = RecordingTransport::new();
        let frame = Frame::new(
            1,
            WireOpcode::GetAttr,
            Value::Sequence(vec![Value::Reference(id), Value::TextString("_secret".into())]),
        );
        let reply = core.handle_request(addr(2), frame, transport).unwrap();
        let reply = Frame::decode(&reply).unwrap();
        assert_eq!(reply.opcode, WireOpcode::ReplyErr);
        match reply.payload {
            Value::Sequence(parts) => assert_eq!(parts[0], Value::TextString("AccessDenied".into())),
            _ => panic!("expected error payload"),
        }
    }

    #[test]
    fn underscore_item_keys_are_denied_by_default() {
        let core: Core<DefaultAuthenticator> =
            Core::new(DefaultAuthenticator::default(), RetryPolicy::default(), Duration::from_secs(1));
        let id = core.register(None, Arc::new(Mapping));
        let transport = RecordingTransport::new();
        let frame = Frame::new(
            1,
            WireOpcode::GetItem,
            Value::Sequence(vec![Value::Reference(id), Value::TextString("_secret".into())]),
        );
        let reply = core.handle_request(addr(2), frame, transport).unwrap();
        let reply = Frame::decode(&reply).unwrap();
        assert_eq!(reply.opcode, WireOpcode::ReplyErr);
        match reply.payload {
            Value::Sequence(parts) => assert_eq!(parts[0], Value::TextString("AccessDenied".into())),
            _ => panic!("expected error payload"),
        }
    }

    #[test]
    fn call_invokes_the_target_and_returns_its_result() {
        let core: Core<DefaultAuthenticator> =
            Core::new(DefaultAuthenticator::default(), RetryPolicy::default(), Duration::from_secs(1));
        let id = core.register(Some("greeter"), Arc::new(Greeter));
        let transport = RecordingTransport::new();
        let frame = Frame::new(
            1,
            WireOpcode::Call,
            Value::Sequence(vec![
                Value::Reference(id),
                Value::Sequence(vec![Value::TextString("world".into())]),
                Value::Mapping(vec![]),
            ]),
        );
        let reply = core.handle_request(addr(3), frame, transport).unwrap();
        let reply = Frame::decode(&reply).unwrap();
        assert_eq!(reply.payload, Value::TextString("hi world".into()));
    }

    #[test]
    fn duplicate_tid_yields_cached_reply_not_second_execution() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct Counter(AtomicU32);
        impl RemoteObject for Counter {
            fn call(&self, _: Vec<HostValue>, _: Vec<(String, HostValue)>) -> Result<HostValue, Error> {
                let n = self.0.fetch_add(1, Ordering::SeqCst);
                Ok(HostValue::Value(Value::SignedInt(n as i64)))
            }
        }

        let core: Core<DefaultAuthenticator> =
            Core::new(DefaultAuthenticator::default(), RetryPolicy::default(), Duration::from_secs(1));
        let id = core.register(None, Arc::new(Counter(AtomicU32::new(0))));
        let transport = RecordingTransport::new();

        let make_frame = || {
            Frame::new(
                42,
                WireOpcode::Call,
                Value::Sequence(vec![
                    Value::Reference(id),
                    Value::Sequence(vec![]),
                    Value::Mapping(vec![]),
                ]),
            )
        };

        let first = core.handle_request(addr(4), make_frame(), transport.clone()).unwrap();
        let second = core.handle_request(addr(4), make_frame(), transport).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn hello_rejects_a_mismatched_protocol_version() {
        let core: Core<DefaultAuthenticator> =
            Core::new(DefaultAuthenticator::default(), RetryPolicy::default(), Duration::from_secs(1));
        let transport = RecordingTransport::new();
        let mut frame = Frame::new(1, WireOpcode::Hello, Value::Nil);
        frame.version = codec::VERSION + 1;
        let reply = core.handle_request(addr(7), frame, transport).unwrap();
        let reply = Frame::decode(&reply).unwrap();
        assert_eq!(reply.opcode, WireOpcode::ReplyErr);
        match reply.payload {
            Value::Sequence(parts) => assert_eq!(parts[0], Value::TextString("UnsupportedVersion".into())),
            _ => panic!("expected error payload"),
        }
    }

    #[test]
    fn unknown_name_resolves_to_not_found() {
        let core: Core<DefaultAuthenticator> =
            Core::new(DefaultAuthenticator::default(), RetryPolicy::default(), Duration::from_secs(1));
        let transport = RecordingTransport::new();
        let frame = Frame::new(1, WireOpcode::Resolve, Value::TextString("nope".into()));
        let reply = core.handle_request(addr(5), frame, transport).unwrap();
        let reply = Frame::decode(&reply).unwrap();
        assert_eq!(reply.opcode, WireOpcode::ReplyErr);
    }

    #[test]
    fn drop_import_forgets_the_cache_and_sends_release() {
        let core: Core<DefaultAuthenticator> =
            Core::new(DefaultAuthenticator::default(), RetryPolicy::default(), Duration::from_secs(1));
        let transport = RecordingTransport::new();
        let peer = core.connect(addr(8)).unwrap();

        let first = core.import_from(&peer, 7, transport.clone());
        core.drop_import(&peer, 7, transport.clone());
        let second = core.import_from(&peer, 7, transport.clone());
        assert!(
            !Arc::ptr_eq(&first, &second),
            "drop_import should forget the cached Proxy so a later import builds a fresh one"
        );

        let sent = transport.sent.lock().unwrap();
        let (dest, bytes) = sent.last().unwrap();
        assert_eq!(*dest, addr(8));
        let frame = Frame::decode(bytes).unwrap();
        assert_eq!(frame.opcode, WireOpcode::Release);
        assert_eq!(frame.payload, Value::Reference(7));
    }

    #[test]
    fn stopping_wakes_outstanding_waiters() {
        let core: Arc<Core<DefaultAuthenticator>> = Arc::new(Core::new(
            DefaultAuthenticator::default(),
            RetryPolicy {
                retries: 50,
                base_interval: Duration::from_secs(30),
            },
            Duration::from_secs(1),
        ));
        let transport = RecordingTransport::new();
        let core2 = core.clone();
        let transport2 = transport.clone();
        let handle = std::thread::spawn(move || {
            core2
                .transactions
                .request(transport2.as_ref(), addr(6), WireOpcode::Hello, Value::Nil, &core2.retry)
        });
        while core.transactions.outstanding() == 0 {
            std::thread::yield_now();
        }
        core.stop();
        assert!(matches!(handle.join().unwrap(), Err(Error::ServiceStopped)));
    }
}
