//! Binary frame protocol spoken between consumers and providers.

mod decoder;
mod header;
mod message;

pub use decoder::FrameDecoder;
pub use header::{
    decode_sign, encode_sign, Header, MessageKind, Status, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE,
    MAGIC, REQUEST_STATUS,
};
pub use message::{encode_heartbeat, Message, RequestFrame, ResponseFrame};
