use std::fmt;

use thiserror::Error;

use crate::meta::Address;
use crate::protocol::Status;

/// Malformed frame on the wire.
///
/// A protocol error is fatal to the connection that produced it: the channel
/// is closed and its watchdog takes over. It never fails calls in flight on
/// other connections.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("illegal magic 0x{0:04x}")]
    IllegalMagic(u16),

    #[error("illegal sign 0x{0:02x}")]
    IllegalSign(u8),

    #[error("illegal status 0x{0:02x}")]
    IllegalStatus(u8),

    #[error("body of {len} bytes exceeds maximum of {max} bytes")]
    BodyTooLarge { len: u32, max: u32 },
}

/// Which side of the wire a timeout is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// The request never made it onto the socket before the deadline.
    Client,
    /// The request was flushed but no response arrived in time.
    Server,
}

impl TimeoutKind {
    /// Status code carried by a synthesized timeout response.
    pub fn status(self) -> Status {
        match self {
            TimeoutKind::Client => Status::ClientTimeout,
            TimeoutKind::Server => Status::ServerTimeout,
        }
    }
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Client => f.write_str("CLIENT_TIMEOUT"),
            TimeoutKind::Server => f.write_str("SERVER_TIMEOUT"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SaturnError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Remote error from {address} ({status}): {message}")]
    Remote {
        address: Address,
        status: Status,
        message: String,
    },

    #[error("{kind} after {timeout_ms}ms (invoke id {invoke_id})")]
    Timeout {
        kind: TimeoutKind,
        invoke_id: u64,
        timeout_ms: u64,
        address: Option<Address>,
    },

    #[error("Business error from {address}: {message}")]
    Biz { address: Address, message: String },

    #[error("No available provider for {0}")]
    NoAvailableProvider(String),

    #[error("All {attempts} attempts failed, last cause: {last}")]
    AllAttemptsFailed {
        attempts: usize,
        #[source]
        last: Box<SaturnError>,
    },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Result of invoke {0} was already taken")]
    AlreadyConsumed(u64),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SaturnError {
    /// Application-level failure reported by the provider.
    pub fn is_biz(&self) -> bool {
        matches!(self, SaturnError::Biz { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SaturnError::Timeout { .. })
    }

    /// Timeout classification, looking through fail-over wrapping.
    pub fn timeout_kind(&self) -> Option<TimeoutKind> {
        match self.root_cause() {
            SaturnError::Timeout { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// The innermost error once fail-over wrapping is removed.
    pub fn root_cause(&self) -> &SaturnError {
        match self {
            SaturnError::AllAttemptsFailed { last, .. } => last.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, SaturnError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout(kind: TimeoutKind) -> SaturnError {
        SaturnError::Timeout {
            kind,
            invoke_id: 7,
            timeout_ms: 50,
            address: None,
        }
    }

    #[test]
    fn test_timeout_kind_through_wrapping() {
        let wrapped = SaturnError::AllAttemptsFailed {
            attempts: 3,
            last: Box::new(timeout(TimeoutKind::Server)),
        };
        assert_eq!(wrapped.timeout_kind(), Some(TimeoutKind::Server));
        assert!(!wrapped.is_timeout());
        assert!(wrapped.root_cause().is_timeout());
    }

    #[test]
    fn test_timeout_display() {
        let err = timeout(TimeoutKind::Client);
        assert_eq!(err.to_string(), "CLIENT_TIMEOUT after 50ms (invoke id 7)");
    }

    #[test]
    fn test_biz_classification() {
        let err = SaturnError::Biz {
            address: Address::new("127.0.0.1", 18090),
            message: "insufficient funds".to_string(),
        };
        assert!(err.is_biz());
        assert!(err.timeout_kind().is_none());
    }

    #[test]
    fn test_protocol_error_messages() {
        assert_eq!(
            ProtocolError::IllegalMagic(0x1234).to_string(),
            "illegal magic 0x1234"
        );
        assert_eq!(ProtocolError::IllegalSign(0x05).to_string(), "illegal sign 0x05");
    }
}
