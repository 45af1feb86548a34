//! Incremental frame decoder.
//!
//! Accumulates partial socket reads in a `BytesMut` and emits every complete
//! frame. Parsing is a two-state machine:
//! - `WaitingForHeader`: need 16 bytes
//! - `WaitingForBody`: header validated, need `body_length` more bytes
//!
//! Heartbeat frames are consumed here and only counted.

use bytes::{Buf, Bytes, BytesMut};

use super::header::{Header, MessageKind, Status, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE};
use super::message::{Message, RequestFrame, ResponseFrame};
use crate::error::ProtocolError;

#[derive(Debug, Clone)]
enum State {
    WaitingForHeader,
    WaitingForBody { header: Header, status: Option<Status> },
}

pub struct FrameDecoder {
    buffer: BytesMut,
    state: State,
    max_body_size: u32,
    heartbeats: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY_SIZE)
    }

    pub fn with_max_body(max_body_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::WaitingForHeader,
            max_body_size,
            heartbeats: 0,
        }
    }

    /// Push bytes read from the socket and extract all complete messages.
    ///
    /// Partial data is kept for the next push. After an error the decoder is
    /// in an undefined state and the connection must be dropped.
    ///
    /// # Errors
    ///
    /// Returns an error on an illegal magic, sign or response status, or if
    /// a body exceeds the configured maximum.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Message>, ProtocolError> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        while let Some(message) = self.try_extract_one()? {
            if let Some(message) = message {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Heartbeat frames consumed so far.
    pub fn heartbeats(&self) -> u64 {
        self.heartbeats
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// `Ok(Some(None))` means a frame was consumed but produced nothing
    /// to surface (a heartbeat).
    fn try_extract_one(&mut self) -> Result<Option<Option<Message>>, ProtocolError> {
        if let State::WaitingForHeader = self.state {
            let header = match Header::decode(&self.buffer)? {
                Some(header) => header,
                None => return Ok(None),
            };

            if header.body_length > self.max_body_size {
                return Err(ProtocolError::BodyTooLarge {
                    len: header.body_length,
                    max: self.max_body_size,
                });
            }

            let status = match header.kind {
                MessageKind::Response => Some(
                    Status::from_code(header.status)
                        .ok_or(ProtocolError::IllegalStatus(header.status))?,
                ),
                _ => None,
            };

            self.buffer.advance(HEADER_SIZE);
            self.state = State::WaitingForBody { header, status };
        }

        let (header, status) = match &self.state {
            State::WaitingForBody { header, status } => (*header, *status),
            State::WaitingForHeader => return Ok(None),
        };

        let body_length = header.body_length as usize;
        if self.buffer.len() < body_length {
            return Ok(None);
        }

        let body: Bytes = self.buffer.split_to(body_length).freeze();
        self.state = State::WaitingForHeader;

        let message = match (header.kind, status) {
            (MessageKind::Heartbeat, _) => {
                self.heartbeats += 1;
                tracing::trace!("heartbeat received");
                None
            }
            (MessageKind::Ack, _) => Some(Message::Ack(header.invoke_id)),
            (MessageKind::Request, _) => Some(Message::Request(RequestFrame {
                invoke_id: header.invoke_id,
                serializer_code: header.serializer_code,
                body,
            })),
            (MessageKind::Response, Some(status)) => Some(Message::Response(ResponseFrame {
                invoke_id: header.invoke_id,
                serializer_code: header.serializer_code,
                status,
                body,
            })),
            (MessageKind::Response, None) => return Err(ProtocolError::IllegalStatus(header.status)),
        };

        Ok(Some(message))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
