//! Mapping from application keys to protocol keys. The server limits keys
//! to 250 bytes with no whitespace or control bytes; the transformer runs
//! before validation so callers can feed arbitrary keys through the
//! hashing variant.

use sha1::{Digest, Sha1};
use std::fmt::{self, Write};
use std::sync::Arc;
use thiserror::Error;

/// The longest key the protocol accepts, in bytes.
pub const MAX_KEY_LEN: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key is empty")]
    Empty,
    #[error("key is {0} bytes, limit is 250")]
    TooLong(usize),
    #[error("key contains forbidden byte {0:#04x}")]
    ForbiddenByte(u8),
}

/// Check a protocol key against the server's constraints: 1..=250 bytes,
/// nothing at or below 0x20, no 0x7f.
pub fn validate(key: &[u8]) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Empty);
    }
    if key.len() > MAX_KEY_LEN {
        return Err(KeyError::TooLong(key.len()));
    }
    if let Some(&byte) = key.iter().find(|&&b| b <= 0x20 || b == 0x7f) {
        return Err(KeyError::ForbiddenByte(byte));
    }
    Ok(())
}

/// A custom application-key to protocol-key mapping.
pub trait KeyTransformer: Send + Sync {
    fn transform(&self, key: &[u8]) -> Vec<u8>;
}

/// The shipped key transformations. `Sha1Hex` maps keys of any length to a
/// 40-byte hex digest, which keeps arbitrarily long application keys under
/// the protocol cap.
#[derive(Clone, Default)]
pub enum KeyTransform {
    #[default]
    Identity,
    Lowercase,
    Sha1Hex,
    Custom(Arc<dyn KeyTransformer>),
}

impl KeyTransform {
    /// Transform and validate an application key into a protocol key.
    pub fn apply(&self, key: &[u8]) -> Result<Vec<u8>, KeyError> {
        let out = match self {
            KeyTransform::Identity => key.to_vec(),
            KeyTransform::Lowercase => key.to_ascii_lowercase(),
            KeyTransform::Sha1Hex => sha1_hex(key),
            KeyTransform::Custom(transformer) => transformer.transform(key),
        };
        validate(&out)?;
        Ok(out)
    }
}

impl fmt::Debug for KeyTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyTransform::Identity => f.write_str("Identity"),
            KeyTransform::Lowercase => f.write_str("Lowercase"),
            KeyTransform::Sha1Hex => f.write_str("Sha1Hex"),
            KeyTransform::Custom(_) => f.write_str("Custom"),
        }
    }
}

fn sha1_hex(key: &[u8]) -> Vec<u8> {
    let digest = Sha1::digest(key);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        // Writing to a String cannot fail.
        let _ = write!(out, "{:02x}", byte);
    }
    out.into_bytes()
}
