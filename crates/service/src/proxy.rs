//! Proxy (§4.5): a client-side stand-in whose every capability access is a
//! thin forwarder over the Transaction Layer. Proxies never cache; every
//! access is a round trip.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use codec::{Opcode, Value};

use crate::error::Error;
use crate::peer::{resolve_from_wire, PeerRecord};
use crate::refs::{encode_host_value, ExportTable, HostValue, RemoteObject};
use crate::transaction::{RetryPolicy, Transport, TransactionTable};

pub struct Proxy {
    pub(crate) peer: Arc<PeerRecord>,
    pub(crate) remote_id: u64,
    transport: Arc<dyn Transport>,
    transactions: Arc<TransactionTable>,
    retry: RetryPolicy,
    /// The export table of the local Service this proxy lives in — objects
    /// passed as arguments through this proxy are exported from here, not
    /// from the remote peer.
    local_exports: Arc<ExportTable>,
}

impl Proxy {
    pub fn new(
        peer: Arc<PeerRecord>,
        remote_id: u64,
        transport: Arc<dyn Transport>,
        transactions: Arc<TransactionTable>,
        retry: RetryPolicy,
        local_exports: Arc<ExportTable>,
    ) -> Self {
        Self {
            peer,
            remote_id,
            transport,
            transactions,
            retry,
            local_exports,
        }
    }

    pub fn peer_addr(&self) -> std::net::SocketAddr {
        self.peer.addr
    }

    pub fn remote_id(&self) -> u64 {
        self.remote_id
    }

    fn request(&self, opcode: Opcode, payload: Value) -> Result<Value, Error> {
        self.transactions
            .request(self.transport.as_ref(), self.peer.addr, opcode, payload, &self.retry)
    }

    fn request_to_host(&self, opcode: Opcode, payload: Value) -> Result<HostValue, Error> {
        let value = self.request(opcode, payload)?;
        Ok(resolve_from_wire(
            value,
            &self.peer,
            self.transactions.clone(),
            self.retry.clone(),
            self.transport.clone(),
            self.local_exports.clone(),
        ))
    }

    fn reference(&self) -> Value {
        Value::Reference(self.remote_id)
    }

    fn encode_arg(&self, value: &HostValue) -> Result<Value, Error> {
        Ok(encode_host_value(value, &self.local_exports)?)
    }
}

impl RemoteObject for Proxy {
    fn get_attr(&self, name: &str) -> Result<HostValue, Error> {
        self.request_to_host(
            Opcode::GetAttr,
            Value::Sequence(vec![self.reference(), Value::TextString(name.to_string())]),
        )
    }

    fn set_attr(&self, name: &str, value: HostValue) -> Result<(), Error> {
        let wire = self.encode_arg(&value)?;
        self.request(
            Opcode::SetAttr,
            Value::Sequence(vec![self.reference(), Value::TextString(name.to_string()), wire]),
        )?;
        Ok(())
    }

    fn del_attr(&self, name: &str) -> Result<(), Error> {
        self.request(
            Opcode::DelAttr,
            Value::Sequence(vec![self.reference(), Value::TextString(name.to_string())]),
        )?;
        Ok(())
    }

    fn get_item(&self, key: HostValue) -> Result<HostValue, Error> {
        let key_wire = self.encode_arg(&key)?;
        self.request_to_host(Opcode::GetItem, Value::Sequence(vec![self.reference(), key_wire]))
    }

    fn set_item(&self, key: HostValue, value: HostValue) -> Result<(), Error> {
        let key_wire = self.encode_arg(&key)?;
        let val_wire = self.encode_arg(&value)?;
        self.request(
            Opcode::SetItem,
            Value::Sequence(vec![self.reference(), key_wire, val_wire]),
        )?;
        Ok(())
    }

    fn del_item(&self, key: HostValue) -> Result<(), Error> {
        let key_wire = self.encode_arg(&key)?;
        self.request(Opcode::DelItem, Value::Sequence(vec![self.reference(), key_wire]))?;
        Ok(())
    }

    fn len(&self) -> Result<i64, Error> {
        match self.request(Opcode::Len, self.reference())? {
            Value::SignedInt(n) => Ok(n),
            _ => Err(Error::MalformedValue { offset: 0 }),
        }
    }

    fn str(&self) -> Result<String, Error> {
        match self.request(Opcode::Str, self.reference())? {
            Value::TextString(s) => Ok(s),
            _ => Err(Error::MalformedValue { offset: 0 }),
        }
    }

    fn repr(&self) -> Result<String, Error> {
        match self.request(Opcode::Repr, self.reference())? {
            Value::TextString(s) => Ok(s),
            _ => Err(Error::MalformedValue { offset: 0 }),
        }
    }

    fn call(
        &self,
        args: Vec<HostValue>,
        kwargs: Vec<(String, HostValue)>,
    ) -> Result<HostValue, Error> {
        let mut args_wire = Vec::with_capacity(args.len());
        for arg in &args {
            args_wire.push(self.encode_arg(arg)?);
        }
        let mut kwargs_wire = Vec::with_capacity(kwargs.len());
        for (k, v) in &kwargs {
            kwargs_wire.push((Value::TextString(k.clone()), self.encode_arg(v)?));
        }
        self.request_to_host(
            Opcode::Call,
            Value::Sequence(vec![
                self.reference(),
                Value::Sequence(args_wire),
                Value::Mapping(kwargs_wire),
            ]),
        )
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.peer.addr == other.peer.addr && self.remote_id == other.remote_id
    }
}

impl Eq for Proxy {}

impl Hash for Proxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer.addr.hash(state);
        self.remote_id.hash(state);
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        // Best-effort RELEASE for the common case where the application
        // never calls the deterministic `Core::drop_import`/`Service::drop_import`
        // and instead just lets its last `Arc<Proxy>` go out of scope (§9:
        // weak back-reference from the import table + RELEASE on reclaim).
        if let Ok(bytes) = codec::Frame::new(0, Opcode::Release, self.reference()).encode() {
            let _ = self.transport.send_datagram(self.peer.addr, bytes);
        }
    }
}
