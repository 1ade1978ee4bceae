//! The async half of Network Object Mirroring (§4.6): owns the UDP socket,
//! the receiver task, and the worker pool the synchronous `netmirror-service`
//! engine is driven from. `netmirror-service` never touches tokio; this
//! crate is the only place a runtime is required.
//!
//! `Proxy` methods (`get_attr`, `call`, ...) block their calling thread on a
//! condvar until the reply arrives. `Service::connect`/`resolve` already run
//! off the async runtime via `spawn_blocking`; callers invoking a `Proxy`
//! method from async code should do the same.

pub mod pool;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use service::{
    Authenticator, Core, DefaultAuthenticator, Error, Frame, HostValue, Opcode, PeerRecord, Proxy,
    RemoteObject, RetryPolicy, Transport, Value,
};
use tokio::net::UdpSocket;

use pool::WorkerPool;

const DATAGRAM_BUF: usize = 2048;

/// Sends already-framed datagrams over a shared tokio socket from worker
/// threads outside the tokio runtime, via [`tokio::runtime::Handle::block_on`].
struct UdpTransport {
    socket: Arc<UdpSocket>,
    runtime: tokio::runtime::Handle,
}

impl Transport for UdpTransport {
    fn send_datagram(&self, peer: SocketAddr, bytes: Vec<u8>) -> std::io::Result<()> {
        self.runtime
            .block_on(self.socket.send_to(&bytes, peer))
            .map(|_| ())
    }
}

pub struct ServiceOptions<A: Authenticator> {
    pub bind_addr: SocketAddr,
    pub authenticator: A,
    pub worker_threads: usize,
    pub retry: RetryPolicy,
    pub reply_cache_ttl: Duration,
}

impl Default for ServiceOptions<DefaultAuthenticator> {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().unwrap(),
            authenticator: DefaultAuthenticator::default(),
            worker_threads: num_cpus(),
            retry: RetryPolicy::default(),
            reply_cache_ttl: Duration::from_secs(30),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// A bound, running peer. Dropping it stops the receiver task and joins the
/// worker pool.
pub struct Service<A: Authenticator + 'static> {
    core: Arc<Core<A>>,
    transport: Arc<dyn Transport>,
    pool: Arc<WorkerPool>,
    receiver: tokio::task::JoinHandle<()>,
    local_addr: SocketAddr,
}

impl<A: Authenticator + 'static> Service<A> {
    /// Binds the socket, starts the receiver task and the worker pool.
    pub async fn bind(options: ServiceOptions<A>) -> anyhow::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(options.bind_addr).await?);
        let local_addr = socket.local_addr()?;

        let core = Arc::new(Core::new(options.authenticator, options.retry, options.reply_cache_ttl));
        let transport: Arc<dyn Transport> = Arc::new(UdpTransport {
            socket: socket.clone(),
            runtime: tokio::runtime::Handle::current(),
        });
        let pool = Arc::new(WorkerPool::new(options.worker_threads.max(1)));

        let receiver = {
            let socket = socket.clone();
            let core = core.clone();
            let transport = transport.clone();
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; DATAGRAM_BUF];
                loop {
                    let (size, addr) = match socket.recv_from(&mut buf).await {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("netmirror: recv_from failed: {e}");
                            continue;
                        }
                    };
                    let datagram = buf[..size].to_vec();
                    let core = core.clone();
                    let transport = transport.clone();
                    let socket = socket.clone();
                    pool.submit(move || dispatch_datagram(&core, &transport, &socket, addr, datagram));
                }
            })
        };

        Ok(Arc::new(Self {
            core,
            transport,
            pool,
            receiver,
            local_addr,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Exports `object` into the Reference Table, optionally under a public
    /// name resolvable with [`Service::resolve`].
    pub fn register(&self, name: Option<&str>, object: Arc<dyn RemoteObject>) -> u64 {
        self.core.register(name, object)
    }

    pub fn list_names(&self) -> Vec<String> {
        self.core.list_names()
    }

    /// Admits `addr` as a peer and confirms it is reachable with a `HELLO`
    /// round trip. Runs on the blocking thread pool since the transaction
    /// blocks its calling thread on a condvar until the reply arrives.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Arc<PeerRecord>, Error> {
        let core = self.core.clone();
        let transport = self.transport.clone();
        tokio::task::spawn_blocking(move || {
            let peer = core.connect(addr)?;
            core.transactions
                .request(transport.as_ref(), addr, Opcode::Hello, Value::Nil, &core.retry)?;
            peer.touch();
            Ok(peer)
        })
        .await
        .expect("connect task panicked")
    }

    /// Resolves a published name on `peer` into a Proxy. Also runs on the
    /// blocking thread pool; see [`Service::connect`].
    pub async fn resolve(&self, peer: &Arc<PeerRecord>, name: &str) -> Result<Arc<Proxy>, Error> {
        let core = self.core.clone();
        let transport = self.transport.clone();
        let peer = peer.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            let reply = core.transactions.request(
                transport.as_ref(),
                peer.addr,
                Opcode::Resolve,
                Value::TextString(name),
                &core.retry,
            )?;
            match reply {
                Value::Reference(id) => Ok(core.import_from(&peer, id, transport.clone())),
                _ => Err(Error::MalformedValue { offset: 0 }),
            }
        })
        .await
        .expect("resolve task panicked")
    }

    /// Imports an already-known remote id without a `RESOLVE` round trip,
    /// e.g. one received as part of another call's result.
    pub fn import(&self, peer: &Arc<PeerRecord>, remote_id: u64) -> Arc<Proxy> {
        self.core.import_from(peer, remote_id, self.transport.clone())
    }

    /// Deterministically releases an imported Proxy: forgets the cached
    /// entry and sends `RELEASE` immediately, instead of waiting for the
    /// application to drop its last `Arc<Proxy>`.
    pub fn drop_import(&self, peer: &Arc<PeerRecord>, remote_id: u64) {
        self.core.drop_import(peer, remote_id, self.transport.clone());
    }

    pub fn core(&self) -> &Arc<Core<A>> {
        &self.core
    }
}

impl<A: Authenticator + 'static> Drop for Service<A> {
    fn drop(&mut self) {
        self.core.stop();
        self.receiver.abort();
    }
}

fn dispatch_datagram(
    core: &Arc<Core<impl Authenticator>>,
    transport: &Arc<dyn Transport>,
    socket: &Arc<UdpSocket>,
    addr: SocketAddr,
    datagram: Vec<u8>,
) {
    let frame = match Frame::decode(&datagram) {
        Ok(frame) => frame,
        Err(e) => {
            log::debug!("netmirror: dropping malformed datagram from {addr}: {e}");
            return;
        }
    };

    if frame.opcode.is_reply() {
        core.handle_reply(addr, frame);
        return;
    }

    if let Some(reply_bytes) = core.handle_request(addr, frame, transport.clone()) {
        if let Err(e) = transport.send_datagram(addr, reply_bytes) {
            log::warn!("netmirror: failed to send reply to {addr}: {e}");
        }
    }
    let _ = socket;
}

/// Trivial in-process object useful for smoke tests and the `hello` example:
/// exposes one callable attribute that echoes its argument back.
pub struct Echo;

impl RemoteObject for Echo {
    fn call(&self, args: Vec<HostValue>, _kwargs: Vec<(String, HostValue)>) -> Result<HostValue, Error> {
        Ok(args.into_iter().next().unwrap_or(HostValue::Value(Value::Nil)))
    }
}
