//! Wire protocol: frame layout, header codec, payload contract.
//!
//! A frame is `[u32 header_len][header][u32 payload_len][payload]` with both
//! length prefixes little-endian. The header carries the protocol magic and
//! version, the message direction, the request id, and (for requests) the
//! service and method names. Payload bodies are opaque to the transport:
//! they only have to satisfy [`Encode`] and [`Decode`].

use std::fmt;
use std::str::Utf8Error;

use bytes::{Buf, BufMut};

use crate::buffer::OutputBuffer;

/// Protocol magic, first field of every header.
pub const MAGIC: u32 = 0x5743_414C;

/// Protocol version, rejected on mismatch.
pub const VERSION: u32 = 1;

/// Upper bound on an encoded header; anything larger is a corrupt stream.
pub const MAX_HEADER_LEN: u32 = 16 * 1024;

/// Default upper bound on a payload body.
pub const DEFAULT_MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// Direction of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request = 0,
    Response = 1,
}

impl MessageType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageType::Request),
            1 => Some(MessageType::Response),
            _ => None,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub message_type: MessageType,
    pub request_id: i64,
    pub service: String,
    pub method: String,
}

impl Header {
    pub fn request(request_id: i64, service: &str, method: &str) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            message_type: MessageType::Request,
            request_id,
            service: service.to_string(),
            method: method.to_string(),
        }
    }

    pub fn response(request_id: i64) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            message_type: MessageType::Response,
            request_id,
            service: String::new(),
            method: String::new(),
        }
    }

    /// Serialize into `out`. Service and method names ride on requests only.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u32_le(self.magic);
        out.put_u32_le(self.version);
        out.put_u8(self.message_type as u8);
        out.put_i64_le(self.request_id);
        if self.message_type == MessageType::Request {
            out.put_u16_le(self.service.len() as u16);
            out.put_slice(self.service.as_bytes());
            out.put_u16_le(self.method.len() as u16);
            out.put_slice(self.method.as_bytes());
        }
    }

    /// Parse an encoded header, validating magic, version, and type.
    pub fn decode(mut buf: &[u8]) -> Result<Self, FrameError> {
        if buf.remaining() < 4 + 4 + 1 + 8 {
            return Err(FrameError::Truncated);
        }
        let magic = buf.get_u32_le();
        if magic != MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        let version = buf.get_u32_le();
        if version != VERSION {
            return Err(FrameError::BadVersion(version));
        }
        let type_byte = buf.get_u8();
        let message_type =
            MessageType::from_u8(type_byte).ok_or(FrameError::BadMessageType(type_byte))?;
        let request_id = buf.get_i64_le();

        let (service, method) = match message_type {
            MessageType::Request => {
                let service = take_string(&mut buf)?;
                let method = take_string(&mut buf)?;
                (service, method)
            }
            MessageType::Response => (String::new(), String::new()),
        };
        if buf.has_remaining() {
            return Err(FrameError::TrailingBytes);
        }
        Ok(Self {
            magic,
            version,
            message_type,
            request_id,
            service,
            method,
        })
    }
}

fn take_string(buf: &mut &[u8]) -> Result<String, FrameError> {
    if buf.remaining() < 2 {
        return Err(FrameError::Truncated);
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(FrameError::Truncated);
    }
    let s = std::str::from_utf8(&buf[..len]).map_err(FrameError::BadString)?;
    let s = s.to_string();
    buf.advance(len);
    Ok(s)
}

/// Stage one complete frame into a connection's output buffer.
pub fn encode_frame(tx: &mut OutputBuffer, header: &Header, payload: &[u8]) {
    let mut hbuf = Vec::with_capacity(32 + header.service.len() + header.method.len());
    header.encode(&mut hbuf);
    tx.append(&(hbuf.len() as u32).to_le_bytes());
    tx.append(&hbuf);
    tx.append(&(payload.len() as u32).to_le_bytes());
    tx.append(payload);
}

/// Stream-corruption taxonomy. Every variant is fatal to its connection: a
/// length-prefixed stream cannot be resynchronized once a prefix is suspect.
#[derive(Debug)]
pub enum FrameError {
    BadMagic(u32),
    BadVersion(u32),
    BadMessageType(u8),
    HeaderOversize(u32),
    PayloadOversize(u32),
    Truncated,
    TrailingBytes,
    BadString(Utf8Error),
    PayloadDecode(DecodeError),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::BadMagic(m) => write!(f, "bad magic {m:#010x}"),
            FrameError::BadVersion(v) => write!(f, "unsupported version {v}"),
            FrameError::BadMessageType(t) => write!(f, "unknown message type {t}"),
            FrameError::HeaderOversize(n) => write!(f, "header length {n} exceeds limit"),
            FrameError::PayloadOversize(n) => write!(f, "payload length {n} exceeds limit"),
            FrameError::Truncated => write!(f, "header truncated"),
            FrameError::TrailingBytes => write!(f, "trailing bytes after header"),
            FrameError::BadString(e) => write!(f, "name is not valid UTF-8: {e}"),
            FrameError::PayloadDecode(e) => write!(f, "payload decode failed: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Payload serialization contract, encode half.
pub trait Encode {
    fn encode(&self, out: &mut Vec<u8>);

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

/// Payload serialization contract, decode half.
pub trait Decode: Sized {
    fn decode(buf: &[u8]) -> Result<Self, DecodeError>;
}

/// Payload decode failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Truncated,
    BadUtf8,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "payload truncated"),
            DecodeError::BadUtf8 => write!(f, "payload is not valid UTF-8"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl Encode for String {
    fn encode(&self, out: &mut Vec<u8>) {
        out.put_slice(self.as_bytes());
    }
}

impl Decode for String {
    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        String::from_utf8(buf.to_vec()).map_err(|_| DecodeError::BadUtf8)
    }
}

impl Encode for Vec<u8> {
    fn encode(&self, out: &mut Vec<u8>) {
        out.put_slice(self);
    }
}

impl Decode for Vec<u8> {
    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        Ok(buf.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_round_trips() {
        let header = Header::request(42, "EchoService", "Echo");
        let mut buf = Vec::new();
        header.encode(&mut buf);
        let decoded = Header::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn response_header_has_no_names() {
        let header = Header::response(-7);
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), 17);
        let decoded = Header::decode(&buf).unwrap();
        assert_eq!(decoded.request_id, -7);
        assert_eq!(decoded.message_type, MessageType::Response);
        assert!(decoded.service.is_empty());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = Vec::new();
        Header::request(1, "S", "m").encode(&mut buf);
        buf[0] ^= 0xFF;
        assert!(matches!(
            Header::decode(&buf),
            Err(FrameError::BadMagic(_))
        ));
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut buf = Vec::new();
        Header::request(1, "S", "m").encode(&mut buf);
        buf[4] = 0xEE;
        assert!(matches!(
            Header::decode(&buf),
            Err(FrameError::BadVersion(_))
        ));
    }

    #[test]
    fn truncated_header_is_rejected() {
        let mut buf = Vec::new();
        Header::request(1, "EchoService", "Echo").encode(&mut buf);
        assert!(matches!(
            Header::decode(&buf[..buf.len() - 3]),
            Err(FrameError::Truncated)
        ));
    }

    #[test]
    fn frame_layout_is_length_prefixed() {
        let mut tx = OutputBuffer::new();
        let header = Header::request(9, "S", "m");
        encode_frame(&mut tx, &header, b"payload");

        let mut wire = Vec::new();
        tx.write_to(&mut wire).unwrap();

        let hlen = u32::from_le_bytes(wire[..4].try_into().unwrap()) as usize;
        let decoded = Header::decode(&wire[4..4 + hlen]).unwrap();
        assert_eq!(decoded.request_id, 9);
        let plen_at = 4 + hlen;
        let plen =
            u32::from_le_bytes(wire[plen_at..plen_at + 4].try_into().unwrap()) as usize;
        assert_eq!(&wire[plen_at + 4..plen_at + 4 + plen], b"payload");
        assert_eq!(wire.len(), plen_at + 4 + plen);
    }
}
