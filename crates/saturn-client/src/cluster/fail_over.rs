use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use saturn_common::{Address, Result, SaturnError, TimeoutKind};
use saturn_metrics::InvocationMetrics;

use super::ClusterInvoker;
use crate::config::ClusterStrategy;
use crate::dispatcher::{Dispatcher, Invocation};

/// Retry on another provider, up to `retries` extra attempts.
///
/// Every attempt reuses the invocation's invoke id, and all attempts share
/// one time budget: each gets whatever is left of the original timeout.
/// Business errors end the call at once, as does a timeout, since an attempt
/// only times out when the shared budget is spent.
///
/// Because the invoke id is shared, a late response to an earlier attempt
/// completes whichever attempt is registered when it arrives.
pub struct FailOverInvoker {
    dispatcher: Arc<dyn Dispatcher>,
    retries: u32,
    metrics: Arc<InvocationMetrics>,
}

impl FailOverInvoker {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, retries: u32, metrics: Arc<InvocationMetrics>) -> Self {
        Self {
            dispatcher,
            retries,
            metrics,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

#[async_trait]
impl ClusterInvoker for FailOverInvoker {
    fn strategy(&self) -> ClusterStrategy {
        ClusterStrategy::FailOver
    }

    async fn invoke(&self, invocation: &Invocation, timeout: Duration) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        let max_attempts = self.retries as usize + 1;
        let mut tried: Vec<Address> = Vec::with_capacity(max_attempts);
        let mut attempts = 0;
        let mut last: Option<SaturnError> = None;

        while attempts < max_attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if attempts > 0 {
                self.metrics.record_retry();
                debug!(invoke_id = invocation.invoke_id, attempt = attempts + 1, "retrying");
            }
            attempts += 1;

            match self.dispatcher.dispatch(invocation, remaining, &mut tried).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_biz() => return Err(e),
                Err(e) if e.is_timeout() => {
                    last = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(
                        invoke_id = invocation.invoke_id,
                        attempt = attempts,
                        address = ?tried.last(),
                        error = %e,
                        "attempt failed"
                    );
                    last = Some(e);
                }
            }
        }

        let last = last.unwrap_or_else(|| SaturnError::Timeout {
            kind: TimeoutKind::Client,
            invoke_id: invocation.invoke_id,
            timeout_ms: timeout.as_millis() as u64,
            address: None,
        });
        Err(SaturnError::AllAttemptsFailed {
            attempts,
            last: Box::new(last),
        })
    }
}
