//! Shared types for the Saturn RPC consumer runtime.
//!
//! This crate contains the wire protocol, body serializers, service metadata
//! and the error type used across the workspace.

pub mod error;
pub mod meta;
pub mod protocol;
pub mod serializer;

pub use error::{ProtocolError, Result, SaturnError, TimeoutKind};
pub use meta::{Address, RegisterMeta, ServiceMeta, DEFAULT_NAMESPACE, DEFAULT_WEIGHT, MAX_WEIGHT};
pub use protocol::{FrameDecoder, Message, RequestFrame, ResponseFrame, Status};
pub use serializer::{
    JsonSerializer, MessagePackSerializer, MethodCall, ResultWrapper, Serializer, SerializerType,
};
