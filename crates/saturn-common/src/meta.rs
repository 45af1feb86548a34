//! Service metadata: provider addresses, service directories and registrations.
//!
//! Registrations are advertised in the registry backend as ephemeral nodes
//! following this path convention:
//!
//! ```text
//! /<namespace>/provider/<group>/<serviceProviderName>/<version>/<host>:<port>:<weight>:<connCount>
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SaturnError};

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "saturn";

/// Weight assumed for a provider that does not advertise one.
pub const DEFAULT_WEIGHT: u32 = 50;

/// Upper bound for any provider weight.
pub const MAX_WEIGHT: u32 = 100;

/// Connections opened per provider when the registration does not say.
pub const DEFAULT_CONNECTION_COUNT: u32 = 1;

const PROVIDER_SEGMENT: &str = "provider";

/// Remote endpoint of a provider.
///
/// Immutable once constructed; used as the identity key of a `ChannelGroup`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = SaturnError;

    /// Parses `host:port`. The port is taken after the last colon.
    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| SaturnError::Config(format!("Invalid address '{}': missing port", s)))?;
        if host.is_empty() {
            return Err(SaturnError::Config(format!("Invalid address '{}': empty host", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| SaturnError::Config(format!("Invalid address '{}': {}", s, e)))?;
        Ok(Self::new(host, port))
    }
}

impl From<std::net::SocketAddr> for Address {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Identity of a logical service: group, version and provider name.
///
/// Also called the service *directory*. Two providers serving the same
/// `ServiceMeta` are interchangeable from the consumer's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceMeta {
    pub group: String,
    pub version: String,
    pub service_provider_name: String,
}

impl ServiceMeta {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        service_provider_name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            service_provider_name: service_provider_name.into(),
        }
    }

    /// Key under which the directory's channel groups and weights are stored.
    pub fn directory_string(&self) -> String {
        format!(
            "{}-{}-{}",
            self.group, self.service_provider_name, self.version
        )
    }

    /// Parent path of every provider node advertising this service.
    pub fn provider_path(&self, namespace: &str) -> String {
        format!(
            "/{}/{}/{}/{}/{}",
            namespace, PROVIDER_SEGMENT, self.group, self.service_provider_name, self.version
        )
    }
}

impl fmt::Display for ServiceMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.directory_string())
    }
}

/// One provider instance's advertisement of one service.
///
/// Equality and hashing ignore `weight`: the weight is mutable metadata, the
/// rest is identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMeta {
    pub address: Address,
    pub service: ServiceMeta,
    pub weight: u32,
    pub connection_count: u32,
}

impl RegisterMeta {
    pub fn new(address: Address, service: ServiceMeta) -> Self {
        Self {
            address,
            service,
            weight: DEFAULT_WEIGHT,
            connection_count: DEFAULT_CONNECTION_COUNT,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_connection_count(mut self, connection_count: u32) -> Self {
        self.connection_count = connection_count;
        self
    }

    /// Full registry node path for this registration.
    pub fn node_path(&self, namespace: &str) -> String {
        format!(
            "{}/{}:{}:{}:{}",
            self.service.provider_path(namespace),
            self.address.host(),
            self.address.port(),
            self.weight,
            self.connection_count
        )
    }

    /// Parses a registry node path back into a registration.
    ///
    /// The namespace segment is accepted as-is; callers subscribing to one
    /// namespace only ever receive paths from it.
    pub fn from_node_path(path: &str) -> Result<Self> {
        let invalid = |reason: &str| SaturnError::Config(format!("Invalid node path '{}': {}", path, reason));

        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        if segments.len() != 6 {
            return Err(invalid("expected 6 segments"));
        }
        if segments[1] != PROVIDER_SEGMENT {
            return Err(invalid("not a provider path"));
        }
        if segments[2..5].iter().any(|s| s.is_empty()) {
            return Err(invalid("empty service segment"));
        }

        // host may itself contain ':' so split from the right
        let mut leaf = segments[5].rsplitn(4, ':');
        let connection_count = leaf.next().ok_or_else(|| invalid("missing connection count"))?;
        let weight = leaf.next().ok_or_else(|| invalid("missing weight"))?;
        let port = leaf.next().ok_or_else(|| invalid("missing port"))?;
        let host = leaf.next().ok_or_else(|| invalid("missing host"))?;
        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
        let weight = weight.parse::<u32>().map_err(|_| invalid("bad weight"))?;
        let connection_count = connection_count
            .parse::<u32>()
            .map_err(|_| invalid("bad connection count"))?;

        Ok(Self {
            address: Address::new(host, port),
            service: ServiceMeta::new(segments[2], segments[4], segments[3]),
            weight,
            connection_count,
        })
    }
}

impl PartialEq for RegisterMeta {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.service == other.service
            && self.connection_count == other.connection_count
    }
}

impl Eq for RegisterMeta {}

impl Hash for RegisterMeta {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.service.hash(state);
        self.connection_count.hash(state);
    }
}
