use bytes::{Buf, BufMut, BytesMut};

use super::{
    codec::Operation, Opcode, ProtocolError, Status, MAGIC_REQUEST, MAGIC_RESPONSE,
};

/// Every packet starts with a fixed 24-byte header.
pub const HEADER_LEN: usize = 24;

/// A decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: Opcode,
    pub status: Status,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Response {
    pub fn error_for_status(&self) -> Result<(), Status> {
        if self.status.is_ok() {
            Ok(())
        } else {
            Err(self.status)
        }
    }

    /// The item flags carried in the extras of a Get-family response.
    /// Responses without extras report zero.
    pub fn flags(&self) -> u32 {
        match self.extras.get(..4) {
            Some(bytes) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            None => 0,
        }
    }

    /// The counter value carried in the body of an Increment/Decrement
    /// response.
    pub fn counter_value(&self) -> Result<u64, ProtocolError> {
        let bytes: [u8; 8] = self.value[..]
            .try_into()
            .map_err(|_| ProtocolError::BadCounterBody(self.value.len()))?;
        Ok(u64::from_be_bytes(bytes))
    }
}

/// Append a request frame for `op` to the outbound buffer. Writes exactly
/// `24 + extras + key + value` bytes.
pub fn encode_request(op: &Operation, opaque: u32, out: &mut BytesMut) {
    let extras_len = op.extras.len();
    let body_len = extras_len + op.key.len() + op.value.len();
    out.reserve(HEADER_LEN + body_len);
    out.put_u8(MAGIC_REQUEST);
    out.put_u8(op.opcode as u8);
    out.put_u16(op.key.len() as u16);
    out.put_u8(extras_len as u8);
    out.put_u8(0); // data type
    out.put_u16(0); // vbucket
    out.put_u32(body_len as u32);
    out.put_u32(opaque);
    out.put_u64(op.cas);
    op.extras.write(out);
    out.put_slice(&op.key);
    out.put_slice(&op.value);
}

/// Try to decode one response frame from the inbound buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// nothing is consumed in that case. A complete frame is consumed in full.
pub fn decode_response(buf: &mut BytesMut) -> Result<Option<Response>, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let header = &buf[..HEADER_LEN];
    let magic = header[0];
    if magic != MAGIC_RESPONSE {
        return Err(ProtocolError::InvalidMagic(magic));
    }
    let raw_opcode = header[1];
    let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let extras_len = header[4] as usize;
    let status = u16::from_be_bytes([header[6], header[7]]);
    let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if extras_len + key_len > body_len {
        return Err(ProtocolError::BodySizeMismatch);
    }
    if buf.len() < HEADER_LEN + body_len {
        return Ok(None);
    }
    let opcode =
        Opcode::from_u8(raw_opcode).ok_or(ProtocolError::UnknownOpcode(raw_opcode))?;
    let opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
    let cas = u64::from_be_bytes([
        header[16], header[17], header[18], header[19], header[20], header[21], header[22],
        header[23],
    ]);

    let mut frame = buf.split_to(HEADER_LEN + body_len);
    frame.advance(HEADER_LEN);
    let extras = frame.split_to(extras_len).to_vec();
    let key = frame.split_to(key_len).to_vec();
    let value = frame.to_vec();

    Ok(Some(Response {
        opcode,
        status: Status::from_code(status),
        opaque,
        cas,
        extras,
        key,
        value,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Operation;

    #[test]
    fn encode_get_request() {
        let mut out = BytesMut::new();
        encode_request(&Operation::get(b"Hello".to_vec()), 0, &mut out);
        let expect = vec![
            0x80, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x48, 0x65, 0x6c, 0x6c,
            0x6f,
        ];
        assert_eq!(expect, out.to_vec());
    }

    #[test]
    fn encode_add_request() {
        let op = Operation::store(
            Opcode::Add,
            b"Hello".to_vec(),
            b"World".to_vec(),
            0xdeadbeef,
            0x1c20,
            0,
        );
        let mut out = BytesMut::new();
        encode_request(&op, 0, &mut out);
        let expect = vec![
            0x80, 0x02, 0x00, 0x05, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x12, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef,
            0x00, 0x00, 0x1c, 0x20, 0x48, 0x65, 0x6c, 0x6c, 0x6f, 0x57, 0x6f, 0x72, 0x6c, 0x64,
        ];
        assert_eq!(expect, out.to_vec());
    }

    #[test]
    fn encode_counter_extras() {
        let op = Operation::counter(Opcode::Increment, b"n".to_vec(), 2, 10, 0xffff_ffff);
        let mut out = BytesMut::new();
        encode_request(&op, 7, &mut out);
        // 24-byte header, 20 bytes of extras, 1-byte key
        assert_eq!(45, out.len());
        assert_eq!(20, out[4]);
        assert_eq!(&[0, 0, 0, 0, 0, 0, 0, 2], &out[24..32]); // delta
        assert_eq!(&[0, 0, 0, 0, 0, 0, 0, 10], &out[32..40]); // initial
        assert_eq!(&[0xff, 0xff, 0xff, 0xff], &out[40..44]); // expiration
        assert_eq!(b"n", &out[44..45]);
    }

    fn response_bytes(status: u16, extras: &[u8], key: &[u8], value: &[u8]) -> Vec<u8> {
        let body_len = (extras.len() + key.len() + value.len()) as u32;
        let mut out = vec![0x81, 0x00];
        out.extend_from_slice(&(key.len() as u16).to_be_bytes());
        out.push(extras.len() as u8);
        out.push(0);
        out.extend_from_slice(&status.to_be_bytes());
        out.extend_from_slice(&body_len.to_be_bytes());
        out.extend_from_slice(&9u32.to_be_bytes()); // opaque
        out.extend_from_slice(&42u64.to_be_bytes()); // cas
        out.extend_from_slice(extras);
        out.extend_from_slice(key);
        out.extend_from_slice(value);
        out
    }

    #[test]
    fn decode_waits_for_complete_frames() {
        let bytes = response_bytes(0, &[0, 0, 0, 1], b"k", b"v");
        let mut buf = BytesMut::new();
        for &b in &bytes[..bytes.len() - 1] {
            buf.put_u8(b);
            assert_eq!(Ok(None), decode_response(&mut buf));
        }
        buf.put_u8(bytes[bytes.len() - 1]);
        let resp = decode_response(&mut buf).unwrap().unwrap();
        assert_eq!(Opcode::Get, resp.opcode);
        assert_eq!(Status::NoError, resp.status);
        assert_eq!(9, resp.opaque);
        assert_eq!(42, resp.cas);
        assert_eq!(1, resp.flags());
        assert_eq!(b"k".to_vec(), resp.key);
        assert_eq!(b"v".to_vec(), resp.value);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_consumes_only_one_frame() {
        let mut bytes = response_bytes(1, &[], b"", b"");
        bytes.extend(response_bytes(0, &[], b"", b"ok"));
        let mut buf = BytesMut::from(&bytes[..]);
        let first = decode_response(&mut buf).unwrap().unwrap();
        assert_eq!(Status::KeyNotFound, first.status);
        let second = decode_response(&mut buf).unwrap().unwrap();
        assert_eq!(b"ok".to_vec(), second.value);
        assert_eq!(Ok(None), decode_response(&mut buf));
    }

    #[test]
    fn decode_rejects_request_magic() {
        let mut bytes = response_bytes(0, &[], b"", b"");
        bytes[0] = 0x80;
        let mut buf = BytesMut::from(&bytes[..]);
        assert_eq!(
            Err(ProtocolError::InvalidMagic(0x80)),
            decode_response(&mut buf)
        );
    }

    #[test]
    fn decode_rejects_inconsistent_lengths() {
        let mut bytes = response_bytes(0, &[], b"key", b"");
        bytes[11] = 1; // total body shorter than the key
        let mut buf = BytesMut::from(&bytes[..]);
        assert_eq!(
            Err(ProtocolError::BodySizeMismatch),
            decode_response(&mut buf)
        );
    }

    #[test]
    fn counter_body() {
        let bytes = response_bytes(0, &[], b"", &7u64.to_be_bytes());
        let mut buf = BytesMut::from(&bytes[..]);
        let resp = decode_response(&mut buf).unwrap().unwrap();
        assert_eq!(Ok(7), resp.counter_value());

        let bytes = response_bytes(0, &[], b"", b"abc");
        let mut buf = BytesMut::from(&bytes[..]);
        let resp = decode_response(&mut buf).unwrap().unwrap();
        assert_eq!(Err(ProtocolError::BadCounterBody(3)), resp.counter_value());
    }
}
