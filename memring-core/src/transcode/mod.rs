//! Conversion between typed values and the `(flags, bytes)` payload stored
//! by the server. The flags are opaque to memcached; this module uses them
//! as a type tag so a payload is never silently decoded as the wrong type.

#[cfg(feature = "zlib")]
pub mod zlib;

use serde::{de::DeserializeOwned, ser, Serialize};
use std::fmt::{self, Display};
use thiserror::Error;

/// Type tags written into the item flags. Scalars get a fixed tag and a
/// platform-neutral big-endian encoding; everything else is serialized
/// with bincode under the composite tag. Unassigned values are reserved.
pub mod flags {
    /// Composite values serialized with bincode.
    pub const COMPOSITE: u32 = 0;
    /// UTF-8 text, stored as its raw bytes.
    pub const UTF8: u32 = 1;
    /// Raw bytes (types that serialize through `serialize_bytes`).
    pub const BYTES: u32 = 2;
    pub const BOOL: u32 = 3;
    pub const I8: u32 = 4;
    pub const I16: u32 = 5;
    pub const I32: u32 = 6;
    pub const I64: u32 = 7;
    pub const I128: u32 = 8;
    pub const U8: u32 = 9;
    pub const U16: u32 = 10;
    pub const U32: u32 = 11;
    pub const U64: u32 = 12;
    pub const U128: u32 = 13;
    pub const CHAR: u32 = 14;
    pub const UNIT: u32 = 15;
    pub const F32: u32 = 20;
    pub const F64: u32 = 21;
    /// Set on payloads compressed by the zlib transcoder.
    pub const COMPRESSED: u32 = 1 << 28;
}

/// A stored item body: the type tag and the raw bytes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Payload {
    pub flags: u32,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(flags: u32, data: Vec<u8>) -> Self {
        Self { flags, data }
    }
}

/// An error converting between a typed value and a payload.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The stored flags do not decode as the requested type. The raw
    /// payload is still reachable through `Client::get_raw`.
    #[error("stored flags {flags:#x} do not decode as the requested type: {reason}")]
    Mismatch { flags: u32, reason: String },
    #[error("unrecognized type flags: {0:#x}")]
    UnknownFlags(u32),
    #[error("payload truncated: expected {expected} bytes, got {actual}")]
    Corrupt { expected: usize, actual: usize },
    #[error("serialize error: {0}")]
    Serialize(#[from] bincode::Error),
    #[cfg(feature = "zlib")]
    #[error("compression error: {0}")]
    Compression(std::io::Error),
}

impl TranscodeError {
    fn mismatch(flags: u32, err: impl Display) -> Self {
        TranscodeError::Mismatch {
            flags,
            reason: err.to_string(),
        }
    }
}

/// Converts typed values to payloads and back. Implementations must
/// guarantee `decode(encode(v)) == v` for every supported value and fail
/// with [`TranscodeError::Mismatch`] instead of producing garbage when the
/// stored tag does not fit the requested type.
///
/// Clients are generic over their transcoder, so custom implementations
/// just need to satisfy this trait.
pub trait Transcoder: Clone + Send + Sync + 'static {
    fn encode<V: Serialize + ?Sized>(&self, value: &V) -> Result<Payload, TranscodeError>;
    fn decode<V: DeserializeOwned>(&self, payload: &Payload) -> Result<V, TranscodeError>;
}

/// The default transcoder: fixed tags for scalars, bincode for the rest.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTranscoder;

impl Transcoder for DefaultTranscoder {
    fn encode<V: Serialize + ?Sized>(&self, value: &V) -> Result<Payload, TranscodeError> {
        // Classification can only fail for Serialize impls that error out
        // before reaching a data-model call; bincode will report those.
        let scalar = value.serialize(Classifier).unwrap_or(Scalar::Composite);
        let payload = match scalar {
            Scalar::Str(s) => Payload::new(flags::UTF8, s.into_bytes()),
            Scalar::Bytes(b) => Payload::new(flags::BYTES, b),
            Scalar::Bool(v) => Payload::new(flags::BOOL, vec![v as u8]),
            Scalar::I8(v) => Payload::new(flags::I8, v.to_be_bytes().to_vec()),
            Scalar::I16(v) => Payload::new(flags::I16, v.to_be_bytes().to_vec()),
            Scalar::I32(v) => Payload::new(flags::I32, v.to_be_bytes().to_vec()),
            Scalar::I64(v) => Payload::new(flags::I64, v.to_be_bytes().to_vec()),
            Scalar::I128(v) => Payload::new(flags::I128, v.to_be_bytes().to_vec()),
            Scalar::U8(v) => Payload::new(flags::U8, v.to_be_bytes().to_vec()),
            Scalar::U16(v) => Payload::new(flags::U16, v.to_be_bytes().to_vec()),
            Scalar::U32(v) => Payload::new(flags::U32, v.to_be_bytes().to_vec()),
            Scalar::U64(v) => Payload::new(flags::U64, v.to_be_bytes().to_vec()),
            Scalar::U128(v) => Payload::new(flags::U128, v.to_be_bytes().to_vec()),
            Scalar::Char(v) => Payload::new(flags::CHAR, (v as u32).to_be_bytes().to_vec()),
            Scalar::Unit => Payload::new(flags::UNIT, vec![]),
            Scalar::F32(v) => Payload::new(flags::F32, v.to_be_bytes().to_vec()),
            Scalar::F64(v) => Payload::new(flags::F64, v.to_be_bytes().to_vec()),
            Scalar::Composite => Payload::new(flags::COMPOSITE, bincode::serialize(value)?),
        };
        Ok(payload)
    }

    fn decode<V: DeserializeOwned>(&self, payload: &Payload) -> Result<V, TranscodeError> {
        use serde::de::value::{
            BoolDeserializer, BytesDeserializer, CharDeserializer, F32Deserializer,
            F64Deserializer, I128Deserializer, I16Deserializer, I32Deserializer, I64Deserializer,
            I8Deserializer, StrDeserializer, U128Deserializer, U16Deserializer, U32Deserializer,
            U64Deserializer, U8Deserializer, UnitDeserializer,
        };
        type De = serde::de::value::Error;

        let tag = payload.flags;
        let data = &payload.data[..];
        let err = |e: De| TranscodeError::mismatch(tag, e);
        match tag {
            flags::COMPOSITE => {
                bincode::deserialize(data).map_err(|e| TranscodeError::mismatch(tag, e))
            }
            flags::UTF8 => {
                let s = std::str::from_utf8(data).map_err(|e| TranscodeError::mismatch(tag, e))?;
                V::deserialize(StrDeserializer::<De>::new(s)).map_err(err)
            }
            flags::BYTES => V::deserialize(BytesDeserializer::<De>::new(data)).map_err(err),
            flags::BOOL => {
                let [b] = fixed::<1>(data)?;
                V::deserialize(BoolDeserializer::<De>::new(b != 0)).map_err(err)
            }
            flags::I8 => V::deserialize(I8Deserializer::<De>::new(i8::from_be_bytes(fixed(
                data,
            )?)))
            .map_err(err),
            flags::I16 => V::deserialize(I16Deserializer::<De>::new(i16::from_be_bytes(fixed(
                data,
            )?)))
            .map_err(err),
            flags::I32 => V::deserialize(I32Deserializer::<De>::new(i32::from_be_bytes(fixed(
                data,
            )?)))
            .map_err(err),
            flags::I64 => V::deserialize(I64Deserializer::<De>::new(i64::from_be_bytes(fixed(
                data,
            )?)))
            .map_err(err),
            flags::I128 => V::deserialize(I128Deserializer::<De>::new(i128::from_be_bytes(
                fixed(data)?,
            )))
            .map_err(err),
            flags::U8 => V::deserialize(U8Deserializer::<De>::new(u8::from_be_bytes(fixed(
                data,
            )?)))
            .map_err(err),
            flags::U16 => V::deserialize(U16Deserializer::<De>::new(u16::from_be_bytes(fixed(
                data,
            )?)))
            .map_err(err),
            flags::U32 => V::deserialize(U32Deserializer::<De>::new(u32::from_be_bytes(fixed(
                data,
            )?)))
            .map_err(err),
            flags::U64 => V::deserialize(U64Deserializer::<De>::new(u64::from_be_bytes(fixed(
                data,
            )?)))
            .map_err(err),
            flags::U128 => V::deserialize(U128Deserializer::<De>::new(u128::from_be_bytes(
                fixed(data)?,
            )))
            .map_err(err),
            flags::CHAR => {
                let raw = u32::from_be_bytes(fixed(data)?);
                let c = char::from_u32(raw).ok_or(TranscodeError::Corrupt {
                    expected: 4,
                    actual: data.len(),
                })?;
                V::deserialize(CharDeserializer::<De>::new(c)).map_err(err)
            }
            flags::UNIT => V::deserialize(UnitDeserializer::<De>::new()).map_err(err),
            flags::F32 => V::deserialize(F32Deserializer::<De>::new(f32::from_be_bytes(fixed(
                data,
            )?)))
            .map_err(err),
            flags::F64 => V::deserialize(F64Deserializer::<De>::new(f64::from_be_bytes(fixed(
                data,
            )?)))
            .map_err(err),
            other => Err(TranscodeError::UnknownFlags(other)),
        }
    }
}

fn fixed<const N: usize>(data: &[u8]) -> Result<[u8; N], TranscodeError> {
    data.try_into().map_err(|_| TranscodeError::Corrupt {
        expected: N,
        actual: data.len(),
    })
}

/// The top-level shape of a value as seen through serde's data model.
enum Scalar {
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    I128(i128),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    U128(u128),
    Char(char),
    Unit,
    F32(f32),
    F64(f64),
    Composite,
}

#[derive(Debug)]
struct Unclassifiable(String);

impl Display for Unclassifiable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for Unclassifiable {}

impl ser::Error for Unclassifiable {
    fn custom<T: Display>(msg: T) -> Self {
        Unclassifiable(msg.to_string())
    }
}

/// A serializer that only inspects the top level of a value. Scalars are
/// captured; anything compound reports [`Scalar::Composite`] without
/// visiting its elements.
struct Classifier;

/// Compound sink that swallows elements and reports a composite.
struct CompositeProbe;

macro_rules! composite_sink {
    ($trait:path { $($method:ident ( $($arg:ty),* ) ),+ $(,)? }) => {
        impl $trait for CompositeProbe {
            type Ok = Scalar;
            type Error = Unclassifiable;
            $(
                fn $method<T: ?Sized + Serialize>(
                    &mut self,
                    $(_: $arg,)*
                    _value: &T,
                ) -> Result<(), Self::Error> {
                    Ok(())
                }
            )+
            fn end(self) -> Result<Scalar, Self::Error> {
                Ok(Scalar::Composite)
            }
        }
    };
}

composite_sink!(ser::SerializeSeq { serialize_element() });
composite_sink!(ser::SerializeTuple { serialize_element() });
composite_sink!(ser::SerializeTupleStruct { serialize_field() });
composite_sink!(ser::SerializeTupleVariant { serialize_field() });
composite_sink!(ser::SerializeStruct { serialize_field(&'static str) });
composite_sink!(ser::SerializeStructVariant { serialize_field(&'static str) });

impl ser::SerializeMap for CompositeProbe {
    type Ok = Scalar;
    type Error = Unclassifiable;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, _key: &T) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, _value: &T) -> Result<(), Self::Error> {
        Ok(())
    }

    fn end(self) -> Result<Scalar, Self::Error> {
        Ok(Scalar::Composite)
    }
}

impl ser::Serializer for Classifier {
    type Ok = Scalar;
    type Error = Unclassifiable;
    type SerializeSeq = CompositeProbe;
    type SerializeTuple = CompositeProbe;
    type SerializeTupleStruct = CompositeProbe;
    type SerializeTupleVariant = CompositeProbe;
    type SerializeMap = CompositeProbe;
    type SerializeStruct = CompositeProbe;
    type SerializeStructVariant = CompositeProbe;

    fn serialize_bool(self, v: bool) -> Result<Scalar, Self::Error> {
        Ok(Scalar::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<Scalar, Self::Error> {
        Ok(Scalar::I8(v))
    }

    fn serialize_i16(self, v: i16) -> Result<Scalar, Self::Error> {
        Ok(Scalar::I16(v))
    }

    fn serialize_i32(self, v: i32) -> Result<Scalar, Self::Error> {
        Ok(Scalar::I32(v))
    }

    fn serialize_i64(self, v: i64) -> Result<Scalar, Self::Error> {
        Ok(Scalar::I64(v))
    }

    fn serialize_i128(self, v: i128) -> Result<Scalar, Self::Error> {
        Ok(Scalar::I128(v))
    }

    fn serialize_u8(self, v: u8) -> Result<Scalar, Self::Error> {
        Ok(Scalar::U8(v))
    }

    fn serialize_u16(self, v: u16) -> Result<Scalar, Self::Error> {
        Ok(Scalar::U16(v))
    }

    fn serialize_u32(self, v: u32) -> Result<Scalar, Self::Error> {
        Ok(Scalar::U32(v))
    }

    fn serialize_u64(self, v: u64) -> Result<Scalar, Self::Error> {
        Ok(Scalar::U64(v))
    }

    fn serialize_u128(self, v: u128) -> Result<Scalar, Self::Error> {
        Ok(Scalar::U128(v))
    }

    fn serialize_f32(self, v: f32) -> Result<Scalar, Self::Error> {
        Ok(Scalar::F32(v))
    }

    fn serialize_f64(self, v: f64) -> Result<Scalar, Self::Error> {
        Ok(Scalar::F64(v))
    }

    fn serialize_char(self, v: char) -> Result<Scalar, Self::Error> {
        Ok(Scalar::Char(v))
    }

    fn serialize_str(self, v: &str) -> Result<Scalar, Self::Error> {
        Ok(Scalar::Str(v.to_owned()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Scalar, Self::Error> {
        Ok(Scalar::Bytes(v.to_vec()))
    }

    fn serialize_unit(self) -> Result<Scalar, Self::Error> {
        Ok(Scalar::Unit)
    }

    // Options, enums, and newtypes all round-trip through bincode; their
    // inner value is deliberately not unwrapped here so the tag matches
    // what bincode will read back.
    fn serialize_none(self) -> Result<Scalar, Self::Error> {
        Ok(Scalar::Composite)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, _value: &T) -> Result<Scalar, Self::Error> {
        Ok(Scalar::Composite)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Scalar, Self::Error> {
        Ok(Scalar::Composite)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> Result<Scalar, Self::Error> {
        Ok(Scalar::Composite)
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _value: &T,
    ) -> Result<Scalar, Self::Error> {
        Ok(Scalar::Composite)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<Scalar, Self::Error> {
        Ok(Scalar::Composite)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<CompositeProbe, Self::Error> {
        Ok(CompositeProbe)
    }

    fn serialize_tuple(self, _len: usize) -> Result<CompositeProbe, Self::Error> {
        Ok(CompositeProbe)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<CompositeProbe, Self::Error> {
        Ok(CompositeProbe)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<CompositeProbe, Self::Error> {
        Ok(CompositeProbe)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<CompositeProbe, Self::Error> {
        Ok(CompositeProbe)
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<CompositeProbe, Self::Error> {
        Ok(CompositeProbe)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<CompositeProbe, Self::Error> {
        Ok(CompositeProbe)
    }
}
