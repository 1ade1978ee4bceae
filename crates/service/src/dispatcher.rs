//! Operation Dispatcher (§4.4): resolves the target local object, consults
//! the Authenticator, performs the operation, and encodes the result or
//! error. Assumes the reply cache has already been checked by the caller.

use std::sync::Arc;

use codec::{Frame, Opcode, Value};

use crate::authenticator::{Authenticator, OperationContext};
use crate::error::Error;
use crate::peer::{resolve_from_wire, PeerRecord};
use crate::refs::{encode_host_value, RemoteObject};
use crate::transaction::Transport;
use crate::Core;

/// Dispatches one non-reply, non-release frame and builds its reply frame
/// (`REPLY_OK` or `REPLY_ERR`).
pub fn dispatch<A: Authenticator>(
    core: &Core<A>,
    peer: &Arc<PeerRecord>,
    frame: &Frame,
    transport: Arc<dyn Transport>,
) -> Frame {
    match dispatch_inner(core, peer, frame, transport) {
        Ok(value) => Frame::new(frame.tid, Opcode::ReplyOk, value),
        Err(err) => Frame::new(
            frame.tid,
            Opcode::ReplyErr,
            Value::Sequence(vec![
                Value::TextString(err.kind_tag().to_string()),
                Value::TextString(err.to_string()),
            ]),
        ),
    }
}

fn malformed() -> Error {
    Error::MalformedValue { offset: 0 }
}

fn expect_sequence(value: &Value) -> Result<&Vec<Value>, Error> {
    match value {
        Value::Sequence(items) => Ok(items),
        _ => Err(malformed()),
    }
}

fn expect_mapping(value: &Value) -> Result<&Vec<(Value, Value)>, Error> {
    match value {
        Value::Mapping(entries) => Ok(entries),
        _ => Err(malformed()),
    }
}

fn expect_reference(value: &Value) -> Result<u64, Error> {
    match value {
        Value::Reference(id) => Ok(*id),
        _ => Err(malformed()),
    }
}

fn expect_text(value: &Value) -> Result<String, Error> {
    match value {
        Value::TextString(s) => Ok(s.clone()),
        _ => Err(malformed()),
    }
}

fn check_permit<A: Authenticator>(
    core: &Core<A>,
    peer: &Arc<PeerRecord>,
    opcode: Opcode,
    target_id: u64,
    attr_name: Option<&str>,
) -> Result<(), Error> {
    let ctx = OperationContext {
        opcode,
        peer: peer.addr,
        target_id,
        attr_name,
    };
    if core.authenticator.permit(&ctx) {
        Ok(())
    } else {
        Err(Error::AccessDenied)
    }
}

fn resolve_arg<A: Authenticator>(
    core: &Core<A>,
    peer: &Arc<PeerRecord>,
    transport: Arc<dyn Transport>,
    value: Value,
) -> crate::refs::HostValue {
    resolve_from_wire(
        value,
        peer,
        core.transactions.clone(),
        core.retry.clone(),
        transport,
        core.exports.clone(),
    )
}

fn dispatch_inner<A: Authenticator>(
    core: &Core<A>,
    peer: &Arc<PeerRecord>,
    frame: &Frame,
    transport: Arc<dyn Transport>,
) -> Result<Value, Error> {
    match frame.opcode {
        // §6.1: the version byte already travels on every frame's header,
        // so HELLO negotiates by comparing it rather than carrying a
        // version in the payload. This implementation speaks exactly one
        // wire version, so negotiation degenerates to a straight match;
        // a future version bump would widen this to min(ours, theirs).
        Opcode::Hello if frame.version != codec::VERSION => Err(Error::UnsupportedVersion),
        Opcode::Hello => Ok(Value::Nil),
        Opcode::List => Ok(Value::Sequence(
            core.list_names().into_iter().map(Value::TextString).collect(),
        )),
        Opcode::Resolve => {
            let name = expect_text(&frame.payload)?;
            let id = core.resolve_name(&name).ok_or(Error::NotFound)?;
            Ok(Value::Reference(id))
        }
        Opcode::Len | Opcode::Str | Opcode::Repr => {
            let id = expect_reference(&frame.payload)?;
            let object = core.exports.resolve_local(id).ok_or(Error::NotFound)?;
            check_permit(core, peer, frame.opcode, id, None)?;
            Ok(match frame.opcode {
                Opcode::Len => Value::SignedInt(object.len()?),
                Opcode::Str => Value::TextString(object.str()?),
                Opcode::Repr => Value::TextString(object.repr()?),
                _ => unreachable!(),
            })
        }
        Opcode::GetAttr | Opcode::SetAttr | Opcode::DelAttr => {
            let items = expect_sequence(&frame.payload)?;
            let id = expect_reference(items.first().ok_or_else(malformed)?)?;
            let name = expect_text(items.get(1).ok_or_else(malformed)?)?;
            let object = core.exports.resolve_local(id).ok_or(Error::NotFound)?;
            check_permit(core, peer, frame.opcode, id, Some(&name))?;
            match frame.opcode {
                Opcode::GetAttr => {
                    let hv = object.get_attr(&name)?;
                    Ok(encode_host_value(&hv, &core.exports)?)
                }
                Opcode::SetAttr => {
                    let raw = items.get(2).ok_or_else(malformed)?.clone();
                    let hv = resolve_arg(core, peer, transport, raw);
                    object.set_attr(&name, hv)?;
                    Ok(Value::Nil)
                }
                Opcode::DelAttr => {
                    object.del_attr(&name)?;
                    Ok(Value::Nil)
                }
                _ => unreachable!(),
            }
        }
        Opcode::GetItem | Opcode::SetItem | Opcode::DelItem => {
            let items = expect_sequence(&frame.payload)?;
            let id = expect_reference(items.first().ok_or_else(malformed)?)?;
            let object = core.exports.resolve_local(id).ok_or(Error::NotFound)?;
            let key_raw = items.get(1).ok_or_else(malformed)?.clone();
            let key_name = match &key_raw {
                Value::TextString(s) => Some(s.as_str()),
                _ => None,
            };
            check_permit(core, peer, frame.opcode, id, key_name)?;
            match frame.opcode {
                Opcode::GetItem => {
                    let key = resolve_arg(core, peer, transport, key_raw);
                    let hv = object.get_item(key)?;
                    Ok(encode_host_value(&hv, &core.exports)?)
                }
                Opcode::SetItem => {
                    let val_raw = items.get(2).ok_or_else(malformed)?.clone();
                    let key = resolve_arg(core, peer, transport.clone(), key_raw);
                    let val = resolve_arg(core, peer, transport, val_raw);
                    object.set_item(key, val)?;
                    Ok(Value::Nil)
                }
                Opcode::DelItem => {
                    let key = resolve_arg(core, peer, transport, key_raw);
                    object.del_item(key)?;
                    Ok(Value::Nil)
                }
                _ => unreachable!(),
            }
        }
        Opcode::Call => {
            let items = expect_sequence(&frame.payload)?;
            let id = expect_reference(items.first().ok_or_else(malformed)?)?;
            let object = core.exports.resolve_local(id).ok_or(Error::NotFound)?;
            check_permit(core, peer, frame.opcode, id, None)?;
            let args_seq = expect_sequence(items.get(1).ok_or_else(malformed)?)?.clone();
            let kwargs_map = expect_mapping(items.get(2).ok_or_else(malformed)?)?.clone();
            let args = args_seq
                .into_iter()
                .map(|v| resolve_arg(core, peer, transport.clone(), v))
                .collect();
            let mut kwargs = Vec::with_capacity(kwargs_map.len());
            for (k, v) in kwargs_map {
                let name = expect_text(&k)?;
                kwargs.push((name, resolve_arg(core, peer, transport.clone(), v)));
            }
            let hv = object.call(args, kwargs)?;
            Ok(encode_host_value(&hv, &core.exports)?)
        }
        Opcode::Release | Opcode::ReplyOk | Opcode::ReplyErr => {
            unreachable!("handled before dispatch_inner is called")
        }
    }
}

pub(crate) fn expect_reference_payload(value: &Value) -> Result<u64, Error> {
    expect_reference(value)
}
