//! The wire value type: a small tagged union with one-byte tags, plus its
//! self-delimiting encode/decode. See `spec.md` §3–§4.1.

use crate::varint::{read_varint, write_varint, zigzag_decode, zigzag_encode};
use crate::Error;

mod tag {
    pub const NIL: u8 = 0x00;
    pub const BOOLEAN: u8 = 0x01;
    pub const SIGNED_INT: u8 = 0x02;
    pub const FLOAT: u8 = 0x03;
    pub const BYTE_STRING: u8 = 0x04;
    pub const TEXT_STRING: u8 = 0x05;
    pub const SEQUENCE: u8 = 0x06;
    pub const MAPPING: u8 = 0x07;
    pub const REFERENCE: u8 = 0x08;
}

/// A value drawn from the wire-legal variant set. No other shape is
/// representable on the wire; values outside this set reach the wire only
/// via the reference fallback (see `netmirror-service`'s `HostValue`).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Boolean(bool),
    SignedInt(i64),
    Float(f64),
    ByteString(Vec<u8>),
    TextString(String),
    Sequence(Vec<Value>),
    Mapping(Vec<(Value, Value)>),
    /// A peer-relative id naming an export on the other side of the wire.
    Reference(u64),
}

impl Value {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        write_value(&mut buf, self)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Value, Error> {
        let mut pos = 0;
        let value = read_value(buf, &mut pos)?;
        Ok(value)
    }

    /// Decodes a value occupying a prefix of `buf`, returning it along with
    /// the number of bytes consumed. Used by the frame decoder, where the
    /// payload is the remainder of a larger datagram.
    pub fn decode_prefix(buf: &[u8]) -> Result<(Value, usize), Error> {
        let mut pos = 0;
        let value = read_value(buf, &mut pos)?;
        Ok((value, pos))
    }
}

fn write_value(buf: &mut Vec<u8>, value: &Value) -> Result<(), Error> {
    match value {
        Value::Nil => buf.push(tag::NIL),
        Value::Boolean(b) => {
            buf.push(tag::BOOLEAN);
            buf.push(if *b { 1 } else { 0 });
        }
        Value::SignedInt(n) => {
            buf.push(tag::SIGNED_INT);
            write_varint(buf, zigzag_encode(*n));
        }
        Value::Float(f) => {
            buf.push(tag::FLOAT);
            buf.extend_from_slice(&f.to_le_bytes());
        }
        Value::ByteString(bytes) => {
            buf.push(tag::BYTE_STRING);
            write_varint(buf, bytes.len() as u64);
            buf.extend_from_slice(bytes);
        }
        Value::TextString(s) => {
            buf.push(tag::TEXT_STRING);
            write_varint(buf, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Sequence(items) => {
            buf.push(tag::SEQUENCE);
            write_varint(buf, items.len() as u64);
            for item in items {
                write_value(buf, item)?;
            }
        }
        Value::Mapping(entries) => {
            buf.push(tag::MAPPING);
            write_varint(buf, entries.len() as u64);
            for (k, v) in entries {
                write_value(buf, k)?;
                write_value(buf, v)?;
            }
        }
        Value::Reference(id) => {
            buf.push(tag::REFERENCE);
            write_varint(buf, *id);
        }
    }
    Ok(())
}

fn read_value(buf: &[u8], pos: &mut usize) -> Result<Value, Error> {
    let offset = *pos;
    let tag = *buf.get(offset).ok_or(Error::UnexpectedEof { offset })?;
    *pos += 1;
    Ok(match tag {
        tag::NIL => Value::Nil,
        tag::BOOLEAN => {
            let offset = *pos;
            let b = *buf.get(offset).ok_or(Error::UnexpectedEof { offset })?;
            *pos += 1;
            Value::Boolean(b != 0)
        }
        tag::SIGNED_INT => Value::SignedInt(zigzag_decode(read_varint(buf, pos)?)),
        tag::FLOAT => {
            let offset = *pos;
            let bytes: [u8; 8] = buf
                .get(offset..offset + 8)
                .ok_or(Error::UnexpectedEof { offset })?
                .try_into()
                .unwrap();
            *pos += 8;
            Value::Float(f64::from_le_bytes(bytes))
        }
        tag::BYTE_STRING => {
            let len = read_varint(buf, pos)? as usize;
            let offset = *pos;
            let bytes = buf
                .get(offset..offset + len)
                .ok_or(Error::UnexpectedEof { offset })?
                .to_vec();
            *pos += len;
            Value::ByteString(bytes)
        }
        tag::TEXT_STRING => {
            let len = read_varint(buf, pos)? as usize;
            let offset = *pos;
            let bytes = buf
                .get(offset..offset + len)
                .ok_or(Error::UnexpectedEof { offset })?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| Error::InvalidUtf8 { offset })?
                .to_owned();
            *pos += len;
            Value::TextString(s)
        }
        tag::SEQUENCE => {
            let len = read_varint(buf, pos)? as usize;
            let mut items = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                items.push(read_value(buf, pos)?);
            }
            Value::Sequence(items)
        }
        tag::MAPPING => {
            let len = read_varint(buf, pos)? as usize;
            let mut entries: Vec<(Value, Value)> = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                let key_offset = *pos;
                let key = read_value(buf, pos)?;
                let val = read_value(buf, pos)?;
                if entries.iter().any(|(k, _)| *k == key) {
                    return Err(Error::DuplicateKey { offset: key_offset });
                }
                entries.push((key, val));
            }
            Value::Mapping(entries)
        }
        tag::REFERENCE => Value::Reference(read_varint(buf, pos)?),
        _ => return Err(Error::UnknownTag { offset, tag }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: Value) {
        let bytes = v.encode().unwrap();
        assert_eq!(Value::decode(&bytes).unwrap(), v);
    }

    #[test]
    fn round_trips_every_scalar_kind() {
        round_trip(Value::Nil);
        round_trip(Value::Boolean(true));
        round_trip(Value::Boolean(false));
        round_trip(Value::SignedInt(-12345));
        round_trip(Value::Float(3.25));
        round_trip(Value::ByteString(vec![1, 2, 3]));
        round_trip(Value::TextString("hi world".to_string()));
        round_trip(Value::Reference(42));
    }

    #[test]
    fn round_trips_nested_containers() {
        round_trip(Value::Sequence(vec![
            Value::SignedInt(2),
            Value::SignedInt(3),
        ]));
        round_trip(Value::Mapping(vec![
            (
                Value::TextString("a".into()),
                Value::SignedInt(1),
            ),
            (
                Value::TextString("b".into()),
                Value::Sequence(vec![Value::SignedInt(2), Value::SignedInt(3)]),
            ),
        ]));
    }

    #[test]
    fn duplicate_mapping_keys_are_malformed() {
        let mut buf = Vec::new();
        buf.push(tag::MAPPING);
        write_varint(&mut buf, 2);
        write_value(&mut buf, &Value::TextString("a".into())).unwrap();
        write_value(&mut buf, &Value::SignedInt(1)).unwrap();
        write_value(&mut buf, &Value::TextString("a".into())).unwrap();
        write_value(&mut buf, &Value::SignedInt(2)).unwrap();
        assert!(matches!(
            Value::decode(&buf),
            Err(Error::DuplicateKey { .. })
        ));
    }

    #[test]
    fn invalid_utf8_text_is_malformed() {
        let mut buf = Vec::new();
        buf.push(tag::TEXT_STRING);
        write_varint(&mut buf, 1);
        buf.push(0xff);
        assert!(matches!(Value::decode(&buf), Err(Error::InvalidUtf8 { .. })));
    }

    #[test]
    fn truncated_buffer_is_eof_not_panic() {
        let bytes = Value::SignedInt(500).encode().unwrap();
        assert!(matches!(
            Value::decode(&bytes[..bytes.len() - 1]),
            Err(Error::UnexpectedEof { .. })
        ));
    }
}
