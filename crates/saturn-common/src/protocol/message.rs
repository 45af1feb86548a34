//! Decoded frames and their encoding.

use bytes::{BufMut, Bytes, BytesMut};

use super::header::{Header, MessageKind, Status, HEADER_SIZE, REQUEST_STATUS};

/// Outbound call frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub invoke_id: u64,
    pub serializer_code: u8,
    pub body: Bytes,
}

impl RequestFrame {
    pub fn new(invoke_id: u64, serializer_code: u8, body: impl Into<Bytes>) -> Self {
        Self {
            invoke_id,
            serializer_code,
            body: body.into(),
        }
    }
}

/// Inbound result frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub invoke_id: u64,
    pub serializer_code: u8,
    pub status: Status,
    pub body: Bytes,
}

impl ResponseFrame {
    pub fn new(invoke_id: u64, serializer_code: u8, status: Status, body: impl Into<Bytes>) -> Self {
        Self {
            invoke_id,
            serializer_code,
            status,
            body: body.into(),
        }
    }

    /// Body-less response carrying only a status, used for synthesized timeouts.
    pub fn status_only(invoke_id: u64, status: Status) -> Self {
        Self::new(invoke_id, 0, status, Bytes::new())
    }
}

/// A frame surfaced to the caller of the decoder.
///
/// Heartbeats are consumed by the decoder and never surface here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(RequestFrame),
    Response(ResponseFrame),
    Ack(u64),
}

impl Message {
    pub fn invoke_id(&self) -> u64 {
        match self {
            Message::Request(req) => req.invoke_id,
            Message::Response(resp) => resp.invoke_id,
            Message::Ack(id) => *id,
        }
    }

    fn header(&self) -> Header {
        match self {
            Message::Request(req) => Header::new(
                MessageKind::Request,
                req.serializer_code,
                REQUEST_STATUS,
                req.invoke_id,
                req.body.len() as u32,
            ),
            Message::Response(resp) => Header::new(
                MessageKind::Response,
                resp.serializer_code,
                resp.status.code(),
                resp.invoke_id,
                resp.body.len() as u32,
            ),
            Message::Ack(id) => Header::new(MessageKind::Ack, 0, REQUEST_STATUS, *id, 0),
        }
    }

    fn body(&self) -> &[u8] {
        match self {
            Message::Request(req) => &req.body,
            Message::Response(resp) => &resp.body,
            Message::Ack(_) => &[],
        }
    }

    /// Append the encoded frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        let body = self.body();
        dst.reserve(HEADER_SIZE + body.len());
        dst.put_slice(&self.header().encode());
        dst.put_slice(body);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body().len());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

impl From<RequestFrame> for Message {
    fn from(req: RequestFrame) -> Self {
        Message::Request(req)
    }
}

impl From<ResponseFrame> for Message {
    fn from(resp: ResponseFrame) -> Self {
        Message::Response(resp)
    }
}

/// Encoded heartbeat frame: header only, invoke id 0.
pub fn encode_heartbeat() -> [u8; HEADER_SIZE] {
    Header::new(MessageKind::Heartbeat, 0, REQUEST_STATUS, 0, 0).encode()
}
