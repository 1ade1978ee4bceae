//! The export side of the Reference Table (§4.2), the `RemoteObject`
//! capability interface, and `HostValue` — the value shape used when a
//! dispatched operation's result may include objects that have no direct
//! wire representation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use codec::Value;
use parking_lot::{Mutex, RwLock};

use crate::error::Error;

/// The capability interface every exported object implements: attribute and
/// item access, length, textual conversions, and invocation. Every method
/// defaults to `UnsupportedOperation`, matching the dispatcher's behavior
/// for capabilities a target doesn't support (e.g. `LEN` on a scalar).
pub trait RemoteObject: Send + Sync {
    fn get_attr(&self, _name: &str) -> Result<HostValue, Error> {
        Err(Error::UnsupportedOperation)
    }

    fn set_attr(&self, _name: &str, _value: HostValue) -> Result<(), Error> {
        Err(Error::UnsupportedOperation)
    }

    fn del_attr(&self, _name: &str) -> Result<(), Error> {
        Err(Error::UnsupportedOperation)
    }

    fn get_item(&self, _key: HostValue) -> Result<HostValue, Error> {
        Err(Error::UnsupportedOperation)
    }

    fn set_item(&self, _key: HostValue, _value: HostValue) -> Result<(), Error> {
        Err(Error::UnsupportedOperation)
    }

    fn del_item(&self, _key: HostValue) -> Result<(), Error> {
        Err(Error::UnsupportedOperation)
    }

    fn len(&self) -> Result<i64, Error> {
        Err(Error::UnsupportedOperation)
    }

    fn str(&self) -> Result<String, Error> {
        Err(Error::UnsupportedOperation)
    }

    fn repr(&self) -> Result<String, Error> {
        self.str()
    }

    fn call(
        &self,
        _args: Vec<HostValue>,
        _kwargs: Vec<(String, HostValue)>,
    ) -> Result<HostValue, Error> {
        Err(Error::UnsupportedOperation)
    }
}

/// A value produced or consumed on the host side of a dispatched operation.
/// `Object`/`Shared`/`SharedMap` nodes have no wire representation until
/// [`encode_host_value`] runs the reference fallback over them.
#[derive(Clone)]
pub enum HostValue {
    /// Already wire-legal; passed straight through.
    Value(Value),
    /// Fully decoded/constructed, may contain objects, cannot structurally
    /// cycle (plain owned trees can't alias themselves in Rust).
    List(Vec<HostValue>),
    Map(Vec<(HostValue, HostValue)>),
    /// Opaque handle; exported (or re-used) rather than traversed.
    Object(Arc<dyn RemoteObject>),
    /// Shared, possibly self-referential structure. Application code that
    /// needs to ship a genuinely cyclic graph by value builds one of these;
    /// the encoder rejects a cycle with `Unserializable` instead of looping.
    Shared(Rc<RefCell<Vec<HostValue>>>),
    SharedMap(Rc<RefCell<Vec<(HostValue, HostValue)>>>),
}

/// Flattens a `HostValue` into a wire `Value`, running the reference
/// fallback (exporting `Object` nodes) and rejecting cycles reachable
/// through `Shared`/`SharedMap` aliasing.
pub fn encode_host_value(value: &HostValue, exports: &ExportTable) -> Result<Value, Error> {
    let mut visited = std::collections::HashSet::new();
    encode_inner(value, exports, &mut visited)
}

fn encode_inner(
    value: &HostValue,
    exports: &ExportTable,
    visited: &mut std::collections::HashSet<usize>,
) -> Result<Value, Error> {
    Ok(match value {
        HostValue::Value(v) => v.clone(),
        HostValue::Object(obj) => Value::Reference(exports.export(obj.clone())),
        HostValue::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(encode_inner(item, exports, visited)?);
            }
            Value::Sequence(out)
        }
        HostValue::Map(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                out.push((
                    encode_inner(k, exports, visited)?,
                    encode_inner(v, exports, visited)?,
                ));
            }
            Value::Mapping(out)
        }
        HostValue::Shared(cell) => {
            let ptr = Rc::as_ptr(cell) as usize;
            if !visited.insert(ptr) {
                return Err(Error::Unserializable);
            }
            let items = cell.borrow();
            let mut out = Vec::with_capacity(items.len());
            for item in items.iter() {
                out.push(encode_inner(item, exports, visited)?);
            }
            drop(items);
            visited.remove(&ptr);
            Value::Sequence(out)
        }
        HostValue::SharedMap(cell) => {
            let ptr = Rc::as_ptr(cell) as usize;
            if !visited.insert(ptr) {
                return Err(Error::Unserializable);
            }
            let entries = cell.borrow();
            let mut out = Vec::with_capacity(entries.len());
            for (k, v) in entries.iter() {
                out.push((
                    encode_inner(k, exports, visited)?,
                    encode_inner(v, exports, visited)?,
                ));
            }
            drop(entries);
            visited.remove(&ptr);
            Value::Mapping(out)
        }
    })
}

/// Bidirectional mapping between locally owned objects and process-wide,
/// monotonic, never-reused ids (§4.2).
pub struct ExportTable {
    next_id: AtomicU64,
    by_id: RwLock<AHashMap<u64, Arc<dyn RemoteObject>>>,
    identity: Mutex<Vec<(Arc<dyn RemoteObject>, u64)>>,
    by_name: RwLock<HashMap<String, u64>>,
    refcounts: Mutex<AHashMap<u64, u64>>,
}

impl Default for ExportTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ExportTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            by_id: RwLock::new(AHashMap::new()),
            identity: Mutex::new(Vec::new()),
            by_name: RwLock::new(HashMap::new()),
            refcounts: Mutex::new(AHashMap::new()),
        }
    }

    /// Idempotent: re-exporting the same object (by pointer identity)
    /// returns its existing id.
    pub fn export(&self, object: Arc<dyn RemoteObject>) -> u64 {
        let mut identity = self.identity.lock();
        for (existing, id) in identity.iter() {
            if Arc::ptr_eq(existing, &object) {
                *self.refcounts.lock().entry(*id).or_insert(0) += 1;
                return *id;
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        identity.push((object.clone(), id));
        self.by_id.write().insert(id, object);
        self.refcounts.lock().insert(id, 1);
        id
    }

    /// Assigns an id (via `export`) and records `name -> id`. Re-registering
    /// the same name replaces the mapping; the prior id remains valid until
    /// its refcount drops to zero.
    pub fn register(&self, name: &str, object: Arc<dyn RemoteObject>) -> u64 {
        let id = self.export(object);
        self.by_name.write().insert(name.to_string(), id);
        id
    }

    pub fn resolve_local(&self, id: u64) -> Option<Arc<dyn RemoteObject>> {
        self.by_id.read().get(&id).cloned()
    }

    pub fn resolve_name(&self, name: &str) -> Option<u64> {
        self.by_name.read().get(name).copied()
    }

    pub fn list_names(&self) -> Vec<String> {
        self.by_name.read().keys().cloned().collect()
    }

    /// Advisory refcount decrement in response to a `RELEASE` opcode.
    /// Distributed GC is out of scope (§9); this never removes the entry.
    pub fn release(&self, id: u64) {
        if let Some(count) = self.refcounts.lock().get_mut(&id) {
            *count = count.saturating_sub(1);
        }
    }
}
