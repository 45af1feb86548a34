//! Body serialization.
//!
//! A call body is a [`MethodCall`]; a response body is a [`ResultWrapper`].
//! The serializer used for a frame is identified by the 4-bit code carried in
//! the sign byte, so both ends agree without negotiation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SaturnError};

/// Serializer selection as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializerType {
    #[default]
    Json,
    MessagePack,
}

impl SerializerType {
    pub fn code(self) -> u8 {
        match self {
            SerializerType::Json => JsonSerializer::CODE,
            SerializerType::MessagePack => MessagePackSerializer::CODE,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            JsonSerializer::CODE => Some(SerializerType::Json),
            MessagePackSerializer::CODE => Some(SerializerType::MessagePack),
            _ => None,
        }
    }

    pub fn serializer(self) -> Arc<dyn Serializer> {
        match self {
            SerializerType::Json => Arc::new(JsonSerializer),
            SerializerType::MessagePack => Arc::new(MessagePackSerializer),
        }
    }
}

/// Request body: which method to run and with what arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub service: String,
    pub method: String,
    pub args: Vec<Value>,
}

impl MethodCall {
    pub fn new(service: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            args,
        }
    }
}

/// Response body: either a result value or an error message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultWrapper {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ResultWrapper {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Encodes call bodies and decodes result bodies.
pub trait Serializer: Send + Sync {
    /// 4-bit code written into the sign byte.
    fn code(&self) -> u8;

    fn name(&self) -> &'static str;

    fn encode_call(&self, call: &MethodCall) -> Result<Vec<u8>>;

    fn decode_call(&self, body: &[u8]) -> Result<MethodCall>;

    fn encode_result(&self, result: &ResultWrapper) -> Result<Vec<u8>>;

    fn decode_result(&self, body: &[u8]) -> Result<ResultWrapper>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub const CODE: u8 = 0x01;
}

impl Serializer for JsonSerializer {
    fn code(&self) -> u8 {
        Self::CODE
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_call(&self, call: &MethodCall) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(call)?)
    }

    fn decode_call(&self, body: &[u8]) -> Result<MethodCall> {
        Ok(serde_json::from_slice(body)?)
    }

    fn encode_result(&self, result: &ResultWrapper) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(result)?)
    }

    fn decode_result(&self, body: &[u8]) -> Result<ResultWrapper> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// MessagePack, always written struct-as-map so field order never matters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackSerializer;

impl MessagePackSerializer {
    pub const CODE: u8 = 0x02;
}

impl Serializer for MessagePackSerializer {
    fn code(&self) -> u8 {
        Self::CODE
    }

    fn name(&self) -> &'static str {
        "message_pack"
    }

    fn encode_call(&self, call: &MethodCall) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(call)?)
    }

    fn decode_call(&self, body: &[u8]) -> Result<MethodCall> {
        Ok(rmp_serde::from_slice(body)?)
    }

    fn encode_result(&self, result: &ResultWrapper) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(result)?)
    }

    fn decode_result(&self, body: &[u8]) -> Result<ResultWrapper> {
        Ok(rmp_serde::from_slice(body)?)
    }
}

/// Serializer for a code read off the wire.
pub fn serializer_for_code(code: u8) -> Result<Arc<dyn Serializer>> {
    SerializerType::from_code(code)
        .map(SerializerType::serializer)
        .ok_or_else(|| SaturnError::Serialization(format!("unknown serializer code {}", code)))
}
