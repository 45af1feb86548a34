//! Consumer and runtime configuration.
//!
//! Both structs deserialize from JSON with every field optional; missing
//! fields take the defaults below.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use saturn_common::protocol::DEFAULT_MAX_BODY_SIZE;
use saturn_common::{Result, SaturnError, SerializerType};

/// Load balancing algorithm used by unicast dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerKind {
    #[default]
    RoundRobin,
    Random,
}

/// How one logical call is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One provider chosen by the load balancer.
    #[default]
    Round,
    /// Every available provider of the directory.
    Broadcast,
}

/// Fault-tolerance strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStrategy {
    #[default]
    FailFast,
    FailOver,
    FailSafe,
}

/// Per-service consumer configuration.
///
/// # Default Configuration
///
/// - `timeout_ms`: 3000
/// - `retries`: 2 (fail-over only)
/// - `load_balancer`: round robin
/// - `dispatch`: round
/// - `cluster`: fail-fast
/// - `serializer`: JSON
/// - `connection_count`: 1 per provider
/// - `wait_for_available_ms`: 3000
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub timeout_ms: u64,
    pub retries: u32,
    pub load_balancer: LoadBalancerKind,
    pub dispatch: DispatchMode,
    pub cluster: ClusterStrategy,
    pub serializer: SerializerType,
    pub connection_count: u32,
    pub wait_for_available_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            retries: 2,
            load_balancer: LoadBalancerKind::RoundRobin,
            dispatch: DispatchMode::Round,
            cluster: ClusterStrategy::FailFast,
            serializer: SerializerType::Json,
            connection_count: 1,
            wait_for_available_ms: 3000,
        }
    }
}

impl ConsumerConfig {
    /// Rejects combinations that can never work, before any call is made.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(SaturnError::Config("timeout_ms must be positive".to_string()));
        }
        if self.connection_count == 0 {
            return Err(SaturnError::Config(
                "connection_count must be at least 1".to_string(),
            ));
        }
        if self.dispatch == DispatchMode::Broadcast && self.cluster != ClusterStrategy::FailFast {
            return Err(SaturnError::Config(format!(
                "{:?} is not supported with broadcast dispatch",
                self.cluster
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn wait_for_available(&self) -> Duration {
        Duration::from_millis(self.wait_for_available_ms)
    }
}

/// Settings shared by every client built on one runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Period of the timeout scanner.
    pub scan_interval_ms: u64,
    /// Ramp-up period after a provider (re)connects.
    pub warm_up_ms: u64,
    /// How long an empty group is kept before it may be reclaimed.
    pub loss_interval_ms: u64,
    /// Write-idle period after which a heartbeat is sent.
    pub heartbeat_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    /// Ceiling on the backoff exponent.
    pub reconnect_max_attempts: u32,
    pub max_body_size: u32,
    /// Worker threads for completion callbacks; `None` runs them on the
    /// tokio blocking pool.
    pub callback_workers: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 30,
            warm_up_ms: 10 * 60 * 1000,
            loss_interval_ms: 5 * 60 * 1000,
            heartbeat_interval_ms: 30_000,
            connect_timeout_ms: 3000,
            reconnect_base_delay_ms: 2,
            reconnect_max_attempts: 12,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            callback_workers: None,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scan_interval_ms == 0 {
            return Err(SaturnError::Config("scan_interval_ms must be positive".to_string()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(SaturnError::Config(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.callback_workers == Some(0) {
            return Err(SaturnError::Config(
                "callback_workers must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn warm_up(&self) -> Duration {
        Duration::from_millis(self.warm_up_ms)
    }

    pub fn loss_interval(&self) -> Duration {
        Duration::from_millis(self.loss_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.timeout_ms, 3000);
        assert_eq!(config.retries, 2);
        assert_eq!(config.cluster, ClusterStrategy::FailFast);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_broadcast_rejects_fail_over_and_fail_safe() {
        for cluster in [ClusterStrategy::FailOver, ClusterStrategy::FailSafe] {
            let config = ConsumerConfig {
                dispatch: DispatchMode::Broadcast,
                cluster,
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(SaturnError::Config(_))));
        }

        let config = ConsumerConfig {
            dispatch: DispatchMode::Broadcast,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_consumer_from_partial_json() {
        let config: ConsumerConfig =
            serde_json::from_str(r#"{"timeout_ms": 50, "cluster": "fail_over", "load_balancer": "random"}"#)
                .unwrap();
        assert_eq!(config.timeout_ms, 50);
        assert_eq!(config.cluster, ClusterStrategy::FailOver);
        assert_eq!(config.load_balancer, LoadBalancerKind::Random);
        assert_eq!(config.retries, 2);
    }

    #[test]
    fn test_runtime_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.scan_interval(), Duration::from_millis(30));
        assert_eq!(config.warm_up(), Duration::from_secs(600));
        assert_eq!(config.loss_interval(), Duration::from_secs(300));
        assert_eq!(config.max_body_size, 5 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_runtime_rejects_zero_workers() {
        let config = RuntimeConfig {
            callback_workers: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
