//! Memcached binary protocol framing.
//!
//! Every packet starts with a fixed 24-byte header followed by a body made of
//! extras, key and value, in that order:
//!
//! ```text
//! +-------+--------+---------+---------+---------+---------------+
//! | magic | opcode | key len | ext len | data ty | vbucket/status|
//! |  u8   |   u8   |   u16   |   u8    |   u8    |      u16      |
//! +-------+--------+---------+---------+---------+---------------+
//! |  total body len (u32)    |        opaque (u32)               |
//! +--------------------------+-----------------------------------+
//! |                         cas (u64)                            |
//! +--------------------------------------------------------------+
//! ```
//!
//! All integers are big-endian. Requests carry magic `0x80` and a vBucket id
//! in the reserved slot; responses carry magic `0x81` and a status code.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 24;
pub const REQUEST_MAGIC: u8 = 0x80;
pub const RESPONSE_MAGIC: u8 = 0x81;
/// Largest response body accepted, the Couchbase item size limit plus room
/// for key and extras.
pub const MAX_BODY_LEN: usize = 21 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    NoOp = 0x0a,
    Stat = 0x10,
    GetAndTouch = 0x1d,
    SaslListMechs = 0x20,
    SaslAuthStart = 0x21,
    SaslAuthStep = 0x22,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        let opcode = match value {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x02 => Opcode::Add,
            0x03 => Opcode::Replace,
            0x04 => Opcode::Delete,
            0x05 => Opcode::Increment,
            0x06 => Opcode::Decrement,
            0x0a => Opcode::NoOp,
            0x10 => Opcode::Stat,
            0x1d => Opcode::GetAndTouch,
            0x20 => Opcode::SaslListMechs,
            0x21 => Opcode::SaslAuthStart,
            0x22 => Opcode::SaslAuthStep,
            _ => return None,
        };
        Some(opcode)
    }
}

/// Response status codes, including the Couchbase and SASL additions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    NoError,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    NonNumericValue,
    VBucketBelongsToAnotherServer,
    AuthenticationError,
    /// SASL "authentication continue": another step is expected.
    StepRequired,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    Other(u16),
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::NoError => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::ValueTooLarge => 0x0003,
            Status::InvalidArguments => 0x0004,
            Status::ItemNotStored => 0x0005,
            Status::NonNumericValue => 0x0006,
            Status::VBucketBelongsToAnotherServer => 0x0007,
            Status::AuthenticationError => 0x0020,
            Status::StepRequired => 0x0021,
            Status::UnknownCommand => 0x0081,
            Status::OutOfMemory => 0x0082,
            Status::NotSupported => 0x0083,
            Status::InternalError => 0x0084,
            Status::Busy => 0x0085,
            Status::TemporaryFailure => 0x0086,
            Status::Other(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Status::NoError
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        match code {
            0x0000 => Status::NoError,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::ItemNotStored,
            0x0006 => Status::NonNumericValue,
            0x0007 => Status::VBucketBelongsToAnotherServer,
            0x0020 => Status::AuthenticationError,
            0x0021 => Status::StepRequired,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            0x0083 => Status::NotSupported,
            0x0084 => Status::InternalError,
            0x0085 => Status::Busy,
            0x0086 => Status::TemporaryFailure,
            other => Status::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestHeader {
    pub opcode: u8,
    pub key_length: u16,
    pub extra_length: u8,
    pub data_type: u8,
    pub vbucket: u16,
    pub total_body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN);
        buf.put_u8(REQUEST_MAGIC);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key_length);
        buf.put_u8(self.extra_length);
        buf.put_u8(self.data_type);
        buf.put_u16(self.vbucket);
        buf.put_u32(self.total_body_length);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_header(buf, REQUEST_MAGIC)?;
        Ok(Self {
            opcode: buf[1],
            key_length: read_u16(buf, 2),
            extra_length: buf[4],
            data_type: buf[5],
            vbucket: read_u16(buf, 6),
            total_body_length: read_u32(buf, 8),
            opaque: read_u32(buf, 12),
            cas: read_u64(buf, 16),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub key_length: u16,
    pub extra_length: u8,
    pub data_type: u8,
    pub status: u16,
    pub total_body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN);
        buf.put_u8(RESPONSE_MAGIC);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key_length);
        buf.put_u8(self.extra_length);
        buf.put_u8(self.data_type);
        buf.put_u16(self.status);
        buf.put_u32(self.total_body_length);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_header(buf, RESPONSE_MAGIC)?;
        Ok(Self {
            opcode: buf[1],
            key_length: read_u16(buf, 2),
            extra_length: buf[4],
            data_type: buf[5],
            status: read_u16(buf, 6),
            total_body_length: read_u32(buf, 8),
            opaque: read_u32(buf, 12),
            cas: read_u64(buf, 16),
        })
    }

    pub fn status(&self) -> Status {
        Status::from(self.status)
    }

    fn body_fits(&self) -> bool {
        usize::from(self.key_length) + usize::from(self.extra_length)
            <= self.total_body_length as usize
    }
}

fn check_header(buf: &[u8], magic: u8) -> Result<()> {
    if buf.len() < HEADER_LEN {
        return Err(Error::Framing(format!(
            "header needs {HEADER_LEN} bytes, got {}",
            buf.len()
        )));
    }
    if buf[0] != magic {
        return Err(Error::Framing(format!(
            "expected magic {magic:#04x}, got {:#04x}",
            buf[0]
        )));
    }
    Ok(())
}

/// Reads a big-endian `u16` at `offset`. Panics if the slice is too short.
pub fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// Reads a big-endian `u32` at `offset`. Panics if the slice is too short.
pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

/// Reads a big-endian `u64` at `offset`. Panics if the slice is too short.
pub fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

/// A complete response frame with its body split into parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub header: ResponseHeader,
    pub extra: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Response {
    pub fn status(&self) -> Status {
        self.header.status()
    }

    pub fn opaque(&self) -> u32 {
        self.header.opaque
    }

    /// Serializes the frame back to wire format. Used by test servers.
    pub fn encode(&self, buf: &mut BytesMut) {
        let header = ResponseHeader {
            key_length: self.key.len() as u16,
            extra_length: self.extra.len() as u8,
            total_body_length: (self.extra.len() + self.key.len() + self.value.len()) as u32,
            ..self.header
        };
        header.encode(buf);
        buf.put_slice(&self.extra);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
    }
}

/// Splits an inbound byte stream into [`Response`] frames.
#[derive(Debug, Default)]
pub struct ResponseCodec;

impl Decoder for ResponseCodec {
    type Item = Response;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = ResponseHeader::decode(&src[..HEADER_LEN])?;
        if !header.body_fits() {
            return Err(Error::Framing(format!(
                "key ({}) and extras ({}) exceed body length {}",
                header.key_length, header.extra_length, header.total_body_length
            )));
        }

        let body_len = header.total_body_length as usize;
        if body_len > MAX_BODY_LEN {
            return Err(Error::Framing(format!(
                "body length {body_len} exceeds the {MAX_BODY_LEN} byte limit"
            )));
        }

        let frame_len = HEADER_LEN + body_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut body = src.split_to(frame_len).freeze();
        body.advance(HEADER_LEN);
        let extra = body.split_to(usize::from(header.extra_length));
        let key = body.split_to(usize::from(header.key_length));

        Ok(Some(Response {
            header,
            extra,
            key,
            value: body,
        }))
    }
}
