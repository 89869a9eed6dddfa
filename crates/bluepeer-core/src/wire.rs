//! Session wire format.
//!
//! Every frame is a fixed 12-byte header followed by the NAME bytes, the TYPE
//! bytes and the body. NAME is the sender's peer id, TYPE is the content type
//! marker. Multi-byte header fields are big-endian byte arrays so the packed
//! struct never holds a misaligned integer.
//!
//! Status codes follow OBEX: only `STATUS_OK` means success.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::peer::Peer;

/// Content type carried in every frame's TYPE field.
pub const CONTENT_TYPE: &str = "text";

pub const HEADER_LEN: usize = 12;
/// Largest body a peer will accept.
pub const MAX_BODY: usize = 1024 * 1024;

pub const STATUS_OK: u8 = 0xA0;
pub const STATUS_BAD_REQUEST: u8 = 0xC0;
pub const STATUS_NOT_FOUND: u8 = 0xC4;
pub const STATUS_INTERNAL_ERROR: u8 = 0xD0;
pub const STATUS_UNAVAILABLE: u8 = 0xD3;

// ── Header ───────────────────────────────────────────────────────────────────

/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    pub opcode: u8,
    /// Response status; zero on requests.
    pub status: u8,
    /// Reserved for future use, must be zero.
    pub flags: u8,
    pub reserved: u8,
    pub name_len: [u8; 2],
    pub type_len: [u8; 2],
    pub body_len: [u8; 4],
}

assert_eq_size!(FrameHeader, [u8; HEADER_LEN]);

impl FrameHeader {
    pub fn name_len(&self) -> usize {
        u16::from_be_bytes(self.name_len) as usize
    }

    pub fn type_len(&self) -> usize {
        u16::from_be_bytes(self.type_len) as usize
    }

    pub fn body_len(&self) -> usize {
        u32::from_be_bytes(self.body_len) as usize
    }

    /// Bytes that follow this header on the wire.
    pub fn payload_len(&self) -> usize {
        self.name_len() + self.type_len() + self.body_len()
    }

    /// Parse and bounds-check a header.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let header = FrameHeader::read_from_prefix(bytes).ok_or(WireError::Truncated {
            needed: HEADER_LEN,
            got: bytes.len(),
        })?;
        Opcode::try_from(header.opcode)?;
        if header.body_len() > MAX_BODY {
            return Err(WireError::Oversized(header.body_len()));
        }
        Ok(header)
    }
}

// ── Opcodes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Connect = 0x80,
    /// Push an envelope.
    Put = 0x02,
    /// Pull: request/response exchange of a JSON document.
    Get = 0x03,
    Disconnect = 0x81,
    Response = 0xF0,
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x80 => Ok(Opcode::Connect),
            0x02 => Ok(Opcode::Put),
            0x03 => Ok(Opcode::Get),
            0x81 => Ok(Opcode::Disconnect),
            0xF0 => Ok(Opcode::Response),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub status: u8,
    pub name: String,
    pub content_type: String,
    pub body: Bytes,
}

impl Frame {
    pub fn request(opcode: Opcode, name: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            status: 0,
            name: name.into(),
            content_type: CONTENT_TYPE.to_string(),
            body: body.into(),
        }
    }

    pub fn connect(local_id: impl Into<String>) -> Self {
        Self::request(Opcode::Connect, local_id, Bytes::new())
    }

    pub fn disconnect(local_id: impl Into<String>) -> Self {
        Self::request(Opcode::Disconnect, local_id, Bytes::new())
    }

    pub fn response(status: u8, body: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Response,
            status,
            name: String::new(),
            content_type: CONTENT_TYPE.to_string(),
            body: body.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.opcode == Opcode::Response && self.status == STATUS_OK
    }

    pub fn header(&self) -> Result<FrameHeader, WireError> {
        if self.body.len() > MAX_BODY {
            return Err(WireError::Oversized(self.body.len()));
        }
        let name_len = u16::try_from(self.name.len()).map_err(|_| WireError::FieldTooLong("name"))?;
        let type_len =
            u16::try_from(self.content_type.len()).map_err(|_| WireError::FieldTooLong("type"))?;
        Ok(FrameHeader {
            opcode: self.opcode as u8,
            status: self.status,
            flags: 0,
            reserved: 0,
            name_len: name_len.to_be_bytes(),
            type_len: type_len.to_be_bytes(),
            body_len: (self.body.len() as u32).to_be_bytes(),
        })
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let header = self.header()?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + header.payload_len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(self.name.as_bytes());
        buf.put_slice(self.content_type.as_bytes());
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    /// Build a frame from a parsed header and the bytes that follow it.
    pub fn from_parts(header: &FrameHeader, payload: Bytes) -> Result<Self, WireError> {
        let (name_len, type_len) = (header.name_len(), header.type_len());
        if payload.len() != header.payload_len() {
            return Err(WireError::Truncated { needed: header.payload_len(), got: payload.len() });
        }
        let name = std::str::from_utf8(&payload[..name_len])
            .map_err(|_| WireError::InvalidUtf8("name"))?
            .to_string();
        let content_type = std::str::from_utf8(&payload[name_len..name_len + type_len])
            .map_err(|_| WireError::InvalidUtf8("type"))?
            .to_string();
        Ok(Self {
            opcode: Opcode::try_from(header.opcode)?,
            status: header.status,
            name,
            content_type,
            body: payload.slice(name_len + type_len..),
        })
    }

    /// Decode a complete frame from a contiguous buffer.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let header = FrameHeader::parse(bytes)?;
        let rest = &bytes[HEADER_LEN..];
        if rest.len() < header.payload_len() {
            return Err(WireError::Truncated {
                needed: HEADER_LEN + header.payload_len(),
                got: bytes.len(),
            });
        }
        Frame::from_parts(&header, Bytes::copy_from_slice(&rest[..header.payload_len()]))
    }
}

// ── Directory exchange ───────────────────────────────────────────────────────

/// JSON body of a pull. The marker field tells a directory request from a
/// directory reply; anything else is treated as an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum NetOp {
    #[serde(rename = "NetOpReq")]
    Request {
        #[serde(default)]
        peers: Vec<Peer>,
        /// Peer id of the requester, used to address the reply.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    #[serde(rename = "NetOpRes")]
    Reply {
        #[serde(default)]
        peers: Vec<Peer>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
}

impl NetOp {
    pub fn to_json(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Json)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Json)
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("truncated frame: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("frame body of {0} bytes exceeds limit")]
    Oversized(usize),
    #[error("{0} field too long")]
    FieldTooLong(&'static str),
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("{0} field is not valid utf-8")]
    InvalidUtf8(&'static str),
    #[error("json: {0}")]
    Json(serde_json::Error),
}
