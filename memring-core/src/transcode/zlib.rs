use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};
use std::io::Write;

use super::{flags, DefaultTranscoder, Payload, Transcoder, TranscodeError};
use serde::{de::DeserializeOwned, Serialize};

/// The minimum payload size before compression kicks in. Small payloads
/// usually grow under zlib framing.
pub const DEFAULT_MIN_BYTES: usize = 128;

/// A transcoder decorator that compresses encoded payloads with zlib and
/// marks them with [`flags::COMPRESSED`]. Payloads without the marker pass
/// through untouched, so compressed and uncompressed items can share a
/// cluster.
#[derive(Debug, Clone, Copy)]
pub struct ZlibTranscoder<T: Transcoder = DefaultTranscoder> {
    inner: T,
    compression: Compression,
    min_bytes: usize,
}

impl<T: Transcoder> ZlibTranscoder<T> {
    /// Wrap `inner`, compressing payloads of at least `min_bytes` bytes at
    /// the given compression level.
    pub fn new(inner: T, compression: Compression, min_bytes: usize) -> Self {
        ZlibTranscoder {
            inner,
            compression,
            min_bytes,
        }
    }
}

impl Default for ZlibTranscoder<DefaultTranscoder> {
    fn default() -> Self {
        ZlibTranscoder::new(DefaultTranscoder, Compression::default(), DEFAULT_MIN_BYTES)
    }
}

impl<T: Transcoder> Transcoder for ZlibTranscoder<T> {
    fn encode<V: Serialize + ?Sized>(&self, value: &V) -> Result<Payload, TranscodeError> {
        let payload = self.inner.encode(value)?;
        if payload.data.len() < self.min_bytes {
            return Ok(payload);
        }

        let mut out = vec![];
        let mut enc = ZlibEncoder::new(&mut out, self.compression);
        enc.write_all(&payload.data)
            .map_err(TranscodeError::Compression)?;
        enc.finish().map_err(TranscodeError::Compression)?;

        Ok(Payload::new(payload.flags | flags::COMPRESSED, out))
    }

    fn decode<V: DeserializeOwned>(&self, payload: &Payload) -> Result<V, TranscodeError> {
        if payload.flags & flags::COMPRESSED == 0 {
            return self.inner.decode(payload);
        }

        let mut out = vec![];
        let mut dec = ZlibDecoder::new(&mut out);
        dec.write_all(&payload.data)
            .map_err(TranscodeError::Compression)?;
        dec.finish().map_err(TranscodeError::Compression)?;

        let inflated = Payload::new(payload.flags & !flags::COMPRESSED, out);
        self.inner.decode(&inflated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compresses_above_the_threshold() {
        let t = ZlibTranscoder::new(DefaultTranscoder, Compression::new(9), 16);
        let text = "0".repeat(512);

        let compressed = t.encode(&text).unwrap();
        assert_ne!(0, compressed.flags & flags::COMPRESSED);
        assert!(compressed.data.len() < text.len());
        assert_eq!(text, t.decode::<String>(&compressed).unwrap());
    }

    #[test]
    fn small_payloads_pass_through() {
        let t = ZlibTranscoder::default();
        let payload = t.encode("tiny").unwrap();
        assert_eq!(0, payload.flags & flags::COMPRESSED);
        assert_eq!(flags::UTF8, payload.flags);
        assert_eq!("tiny", t.decode::<String>(&payload).unwrap());
    }

    #[test]
    fn uncompressed_payloads_decode_unchanged() {
        let plain = DefaultTranscoder.encode(&12345i32).unwrap();
        let t = ZlibTranscoder::default();
        assert_eq!(12345i32, t.decode::<i32>(&plain).unwrap());
    }
}
