//! Fixed 16-byte frame header.
//!
//! ```text
//! ┌─────────┬──────┬────────┬────────────┬─────────────┐
//! │ Magic   │ Sign │ Status │ Invoke ID  │ Body length │
//! │ 2 bytes │ 1 B  │ 1 B    │ 8 bytes    │ 4 bytes     │
//! │ u16 BE  │      │        │ u64 BE     │ u32 BE      │
//! └─────────┴──────┴────────┴────────────┴─────────────┘
//! ```
//!
//! The sign byte carries the message kind. For requests and responses the
//! low nibble is the kind and the high nibble the serializer code;
//! heartbeats and acks use the whole byte.

use std::fmt;

use crate::error::ProtocolError;

pub const MAGIC: u16 = 0xBABE;

/// Header size in bytes (fixed, exactly 16).
pub const HEADER_SIZE: usize = 16;

/// Default upper bound on a frame body (5 MiB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 5 * 1024 * 1024;

/// Kind of message carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0x01,
    Response = 0x02,
    Ack = 0x7E,
    Heartbeat = 0x7F,
}

impl MessageKind {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Packs a message kind and serializer code into a sign byte.
pub fn encode_sign(kind: MessageKind, serializer_code: u8) -> u8 {
    match kind {
        MessageKind::Request | MessageKind::Response => {
            ((serializer_code & 0x0F) << 4) | (kind.code() & 0x0F)
        }
        MessageKind::Ack | MessageKind::Heartbeat => kind.code(),
    }
}

/// Splits a sign byte into message kind and serializer code.
pub fn decode_sign(sign: u8) -> Result<(MessageKind, u8), ProtocolError> {
    match sign {
        0x7F => Ok((MessageKind::Heartbeat, 0)),
        0x7E => Ok((MessageKind::Ack, 0)),
        _ => {
            let serializer_code = sign >> 4;
            match sign & 0x0F {
                0x01 => Ok((MessageKind::Request, serializer_code)),
                0x02 => Ok((MessageKind::Response, serializer_code)),
                _ => Err(ProtocolError::IllegalSign(sign)),
            }
        }
    }
}

/// Response status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0x20,
    ClientTimeout = 0x1E,
    ServerTimeout = 0x1F,
    BadRequest = 0x28,
    ServiceNotFound = 0x2C,
    ServerError = 0x32,
    ServerBusy = 0x46,
    ServiceExpectedError = 0x50,
    ServiceUnexpectedError = 0x51,
    AppFlowControl = 0x52,
    ProviderFlowControl = 0x53,
    DeserializationFail = 0x5A,
}

impl Status {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let status = match code {
            0x20 => Status::Ok,
            0x1E => Status::ClientTimeout,
            0x1F => Status::ServerTimeout,
            0x28 => Status::BadRequest,
            0x2C => Status::ServiceNotFound,
            0x32 => Status::ServerError,
            0x46 => Status::ServerBusy,
            0x50 => Status::ServiceExpectedError,
            0x51 => Status::ServiceUnexpectedError,
            0x52 => Status::AppFlowControl,
            0x53 => Status::ProviderFlowControl,
            0x5A => Status::DeserializationFail,
            _ => return None,
        };
        Some(status)
    }

    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::ClientTimeout => "CLIENT_TIMEOUT",
            Status::ServerTimeout => "SERVER_TIMEOUT",
            Status::BadRequest => "BAD_REQUEST",
            Status::ServiceNotFound => "SERVICE_NOT_FOUND",
            Status::ServerError => "SERVER_ERROR",
            Status::ServerBusy => "SERVER_BUSY",
            Status::ServiceExpectedError => "SERVICE_EXPECTED_ERROR",
            Status::ServiceUnexpectedError => "SERVICE_UNEXPECTED_ERROR",
            Status::AppFlowControl => "APP_FLOW_CONTROL",
            Status::ProviderFlowControl => "PROVIDER_FLOW_CONTROL",
            Status::DeserializationFail => "DESERIALIZATION_FAIL",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Status byte written on request, heartbeat and ack frames.
pub const REQUEST_STATUS: u8 = 0x00;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageKind,
    pub serializer_code: u8,
    pub status: u8,
    pub invoke_id: u64,
    pub body_length: u32,
}

impl Header {
    pub fn new(kind: MessageKind, serializer_code: u8, status: u8, invoke_id: u64, body_length: u32) -> Self {
        Self {
            kind,
            serializer_code,
            status,
            invoke_id,
            body_length,
        }
    }

    /// Encode header to bytes (big endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&MAGIC.to_be_bytes());
        buf[2] = encode_sign(self.kind, self.serializer_code);
        buf[3] = self.status;
        buf[4..12].copy_from_slice(&self.invoke_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.body_length.to_be_bytes());
        buf
    }

    /// Decode a header from the first 16 bytes of `buf`.
    ///
    /// Returns `Ok(None)` if the buffer is too short, and an error if the
    /// magic or sign byte is not recognised.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != MAGIC {
            return Err(ProtocolError::IllegalMagic(magic));
        }

        let (kind, serializer_code) = decode_sign(buf[2])?;
        let mut invoke_id = [0u8; 8];
        invoke_id.copy_from_slice(&buf[4..12]);

        Ok(Some(Self {
            kind,
            serializer_code,
            status: buf[3],
            invoke_id: u64::from_be_bytes(invoke_id),
            body_length: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }))
    }
}
