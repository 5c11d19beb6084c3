use bytes::{BufMut, BytesMut};

use super::{decode_response, encode_request, Opcode, ProtocolError, Response};

/// Command-specific extras. The variant dictates the extras length on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extras {
    None,
    /// Set/Add/Replace carry item flags and an expiration.
    Store { flags: u32, expire: u32 },
    /// Increment/Decrement carry a delta, an initial value, and an
    /// expiration. An expiration of `0xffff_ffff` makes the operation fail
    /// on absent keys instead of seeding the initial value.
    Counter { delta: u64, initial: u64, expire: u32 },
    /// Flush optionally carries a delay before the flush takes effect.
    Flush { expire: Option<u32> },
}

impl Extras {
    pub fn len(&self) -> usize {
        match self {
            Extras::None => 0,
            Extras::Store { .. } => 8,
            Extras::Counter { .. } => 20,
            Extras::Flush { expire: Some(_) } => 4,
            Extras::Flush { expire: None } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn write(&self, out: &mut BytesMut) {
        match *self {
            Extras::None | Extras::Flush { expire: None } => {}
            Extras::Store { flags, expire } => {
                out.put_u32(flags);
                out.put_u32(expire);
            }
            Extras::Counter {
                delta,
                initial,
                expire,
            } => {
                out.put_u64(delta);
                out.put_u64(initial);
                out.put_u32(expire);
            }
            Extras::Flush {
                expire: Some(expire),
            } => {
                out.put_u32(expire);
            }
        }
    }
}

/// An opcode-level request: everything needed to put a frame on the wire
/// except the opaque, which the owning socket assigns at write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub opcode: Opcode,
    pub key: Vec<u8>,
    pub extras: Extras,
    pub value: Vec<u8>,
    pub cas: u64,
}

impl Operation {
    fn new(opcode: Opcode, key: Vec<u8>, extras: Extras, value: Vec<u8>, cas: u64) -> Self {
        Self {
            opcode,
            key,
            extras,
            value,
            cas,
        }
    }

    pub fn get(key: Vec<u8>) -> Self {
        Self::new(Opcode::Get, key, Extras::None, vec![], 0)
    }

    /// A get whose reply echoes the key.
    pub fn getk(key: Vec<u8>) -> Self {
        Self::new(Opcode::GetK, key, Extras::None, vec![], 0)
    }

    /// A quiet get; misses produce no reply at all.
    pub fn getq(key: Vec<u8>) -> Self {
        Self::new(Opcode::GetQ, key, Extras::None, vec![], 0)
    }

    /// A quiet get whose reply echoes the key; misses stay silent, which
    /// is what makes multi-get pipelines cheap.
    pub fn getkq(key: Vec<u8>) -> Self {
        Self::new(Opcode::GetKQ, key, Extras::None, vec![], 0)
    }

    pub fn store(
        opcode: Opcode,
        key: Vec<u8>,
        value: Vec<u8>,
        flags: u32,
        expire: u32,
        cas: u64,
    ) -> Self {
        Self::new(opcode, key, Extras::Store { flags, expire }, value, cas)
    }

    pub fn delete(key: Vec<u8>) -> Self {
        Self::new(Opcode::Delete, key, Extras::None, vec![], 0)
    }

    pub fn counter(opcode: Opcode, key: Vec<u8>, delta: u64, initial: u64, expire: u32) -> Self {
        Self::new(
            opcode,
            key,
            Extras::Counter {
                delta,
                initial,
                expire,
            },
            vec![],
            0,
        )
    }

    /// Append or Prepend raw bytes to a stored value.
    pub fn concat(opcode: Opcode, key: Vec<u8>, data: Vec<u8>) -> Self {
        Self::new(opcode, key, Extras::None, data, 0)
    }

    pub fn flush(expire: Option<u32>) -> Self {
        Self::new(Opcode::Flush, vec![], Extras::Flush { expire }, vec![], 0)
    }

    pub fn noop() -> Self {
        Self::new(Opcode::Noop, vec![], Extras::None, vec![], 0)
    }

    pub fn version() -> Self {
        Self::new(Opcode::Version, vec![], Extras::None, vec![], 0)
    }

    pub fn stat() -> Self {
        Self::new(Opcode::Stat, vec![], Extras::None, vec![], 0)
    }

    pub fn quit() -> Self {
        Self::new(Opcode::Quit, vec![], Extras::None, vec![], 0)
    }

    pub fn sasl_list() -> Self {
        Self::new(Opcode::SaslList, vec![], Extras::None, vec![], 0)
    }

    pub fn sasl_auth(mechanism: &str, payload: Vec<u8>) -> Self {
        Self::new(
            Opcode::SaslAuth,
            mechanism.as_bytes().to_vec(),
            Extras::None,
            payload,
            0,
        )
    }

    pub fn sasl_step(mechanism: &str, payload: Vec<u8>) -> Self {
        Self::new(
            Opcode::SaslStep,
            mechanism.as_bytes().to_vec(),
            Extras::None,
            payload,
            0,
        )
    }
}

/// The protocol seam. A codec turns opcode-level requests into wire bytes
/// and inbound bytes back into responses. The binary codec below is the
/// implementation this crate ships; a text-dialect codec plugs in through
/// the same interface.
pub trait ProtocolCodec: Send + Sync + 'static {
    /// Append the encoded request to the outbound buffer.
    fn encode(&self, op: &Operation, opaque: u32, out: &mut BytesMut);

    /// Decode one response from the inbound buffer, or `None` if the
    /// buffer does not yet hold a complete frame.
    fn decode(&self, buf: &mut BytesMut) -> Result<Option<Response>, ProtocolError>;
}

/// The memcached binary protocol codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCodec;

impl ProtocolCodec for BinaryCodec {
    fn encode(&self, op: &Operation, opaque: u32, out: &mut BytesMut) {
        encode_request(op, opaque, out);
    }

    fn decode(&self, buf: &mut BytesMut) -> Result<Option<Response>, ProtocolError> {
        decode_response(buf)
    }
}
