//! The Authenticator capability seam (§6.3): a single policy interface
//! consulted on peer admission and every operation dispatch, rather than
//! checks scattered through the dispatcher.

use std::net::SocketAddr;

use codec::Opcode;

/// Context passed to `Authenticator::permit` for one dispatched operation.
pub struct OperationContext<'a> {
    pub opcode: Opcode,
    pub peer: SocketAddr,
    pub target_id: u64,
    /// The attribute or item key under operation, when it is textual:
    /// always present for `GETATTR`/`SETATTR`/`DELATTR`, present for the
    /// item opcodes only when the key happens to be a `TextString`. `None`
    /// for `LEN`/`CALL` and for item opcodes keyed by a non-text `Value`.
    pub attr_name: Option<&'a str>,
}

pub trait Authenticator: Send + Sync {
    /// Invoked on first contact from a previously unknown endpoint.
    fn admit_peer(&self, endpoint: SocketAddr) -> bool {
        let _ = endpoint;
        true
    }

    /// Invoked before dispatch; denial yields `AccessDenied`.
    fn permit(&self, ctx: &OperationContext<'_>) -> bool {
        let _ = ctx;
        true
    }
}

/// Default policy (§6.3): admit all peers; deny any attribute or textual
/// item key that begins with one of `deny_prefixes`; allow everything else.
pub struct DefaultAuthenticator {
    pub deny_prefixes: Vec<String>,
}

impl Default for DefaultAuthenticator {
    fn default() -> Self {
        Self {
            deny_prefixes: vec!["_".to_string()],
        }
    }
}

impl Authenticator for DefaultAuthenticator {
    fn permit(&self, ctx: &OperationContext<'_>) -> bool {
        match ctx.attr_name {
            Some(name) => !self.deny_prefixes.iter().any(|p| name.starts_with(p.as_str())),
            None => true,
        }
    }
}
