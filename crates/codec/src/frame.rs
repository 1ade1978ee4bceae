//! Packet framing: `[magic:4 | version:1 | flags:1 | tid:4 | opcode:1 | payload]`.
//! See `spec.md` §4.3. One datagram carries exactly one message; the codec
//! never fragments.

use crate::value::Value;
use crate::Error;

pub const MAGIC: [u8; 4] = *b"NOM1";
pub const VERSION: u8 = 1;
pub const FLAG_REPLY: u8 = 0b0000_0001;

/// Conservative MTU budget for the encoded frame, per `spec.md` §9 Open
/// Question (i).
pub const MAX_PAYLOAD_BYTES: usize = 1400;

const HEADER_LEN: usize = 4 + 1 + 1 + 4 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    List = 0,
    Resolve = 1,
    GetAttr = 2,
    SetAttr = 3,
    DelAttr = 4,
    GetItem = 5,
    SetItem = 6,
    DelItem = 7,
    Len = 8,
    Str = 9,
    Repr = 10,
    Call = 11,
    Release = 12,
    ReplyOk = 13,
    ReplyErr = 14,
    Hello = 15,
}

impl Opcode {
    fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::List,
            1 => Self::Resolve,
            2 => Self::GetAttr,
            3 => Self::SetAttr,
            4 => Self::DelAttr,
            5 => Self::GetItem,
            6 => Self::SetItem,
            7 => Self::DelItem,
            8 => Self::Len,
            9 => Self::Str,
            10 => Self::Repr,
            11 => Self::Call,
            12 => Self::Release,
            13 => Self::ReplyOk,
            14 => Self::ReplyErr,
            15 => Self::Hello,
            _ => return None,
        })
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, Self::ReplyOk | Self::ReplyErr)
    }
}

/// A decoded (or to-be-encoded) datagram: header plus payload value.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub version: u8,
    pub flags: u8,
    pub tid: u32,
    pub opcode: Opcode,
    pub payload: Value,
}

impl Frame {
    pub fn new(tid: u32, opcode: Opcode, payload: Value) -> Self {
        Self {
            version: VERSION,
            flags: if opcode.is_reply() { FLAG_REPLY } else { 0 },
            tid,
            opcode,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 16);
        buf.extend_from_slice(&MAGIC);
        buf.push(self.version);
        buf.push(self.flags);
        buf.extend_from_slice(&self.tid.to_be_bytes());
        buf.push(self.opcode as u8);
        let payload_bytes = self.payload.encode()?;
        buf.extend_from_slice(&payload_bytes);
        if buf.len() > MAX_PAYLOAD_BYTES {
            return Err(Error::PayloadTooLarge {
                len: buf.len(),
                max: MAX_PAYLOAD_BYTES,
            });
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Frame, Error> {
        if buf.len() < HEADER_LEN {
            return Err(Error::UnexpectedEof { offset: buf.len() });
        }
        if buf[0..4] != MAGIC {
            return Err(Error::BadMagic { offset: 0 });
        }
        let version = buf[4];
        let flags = buf[5];
        let tid = u32::from_be_bytes(buf[6..10].try_into().unwrap());
        let opcode_byte = buf[10];
        let opcode = Opcode::from_byte(opcode_byte).ok_or(Error::UnknownTag {
            offset: 10,
            tag: opcode_byte,
        })?;
        let payload = Value::decode(&buf[HEADER_LEN..])?;
        Ok(Frame {
            version,
            flags,
            tid,
            opcode,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let frame = Frame::new(
            7,
            Opcode::GetAttr,
            Value::Sequence(vec![Value::Reference(1), Value::TextString("x".into())]),
        );
        let bytes = frame.encode().unwrap();
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn reply_opcodes_set_the_reply_flag() {
        let frame = Frame::new(1, Opcode::ReplyOk, Value::Nil);
        assert_eq!(frame.flags & FLAG_REPLY, FLAG_REPLY);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = Frame::new(1, Opcode::Hello, Value::Nil).encode().unwrap();
        bytes[0] = b'X';
        assert!(matches!(Frame::decode(&bytes), Err(Error::BadMagic { .. })));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let big = Value::ByteString(vec![0u8; MAX_PAYLOAD_BYTES * 2]);
        let frame = Frame::new(1, Opcode::Call, big);
        assert!(matches!(
            frame.encode(),
            Err(Error::PayloadTooLarge { .. })
        ));
    }
}
