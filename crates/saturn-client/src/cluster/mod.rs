//! Fault-tolerance strategies.
//!
//! A [`ClusterInvoker`] wraps a [`Dispatcher`] and decides what a failed
//! attempt means for the call. Invokers hold no per-call state; everything
//! about an attempt lives in its `InvokeFuture`.

mod fail_fast;
mod fail_over;
mod fail_safe;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use saturn_common::{Result, SaturnError};
use saturn_metrics::InvocationMetrics;

use crate::config::ClusterStrategy;
use crate::dispatcher::{Dispatcher, Invocation};

pub use fail_fast::FailFastInvoker;
pub use fail_over::FailOverInvoker;
pub use fail_safe::FailSafeInvoker;

#[async_trait]
pub trait ClusterInvoker: Send + Sync {
    fn strategy(&self) -> ClusterStrategy;

    /// Run the call to completion within `timeout`.
    async fn invoke(&self, invocation: &Invocation, timeout: Duration) -> Result<Value>;
}

/// Build the invoker for `strategy`.
///
/// Fails for fail-over and fail-safe on top of a broadcast dispatcher.
pub fn cluster_invoker(
    strategy: ClusterStrategy,
    retries: u32,
    dispatcher: Arc<dyn Dispatcher>,
    metrics: Arc<InvocationMetrics>,
) -> Result<Arc<dyn ClusterInvoker>> {
    if dispatcher.is_broadcast() && strategy != ClusterStrategy::FailFast {
        return Err(SaturnError::Config(format!(
            "{:?} cannot be combined with broadcast dispatch",
            strategy
        )));
    }

    let invoker: Arc<dyn ClusterInvoker> = match strategy {
        ClusterStrategy::FailFast => Arc::new(FailFastInvoker::new(dispatcher)),
        ClusterStrategy::FailOver => Arc::new(FailOverInvoker::new(dispatcher, retries, metrics)),
        ClusterStrategy::FailSafe => Arc::new(FailSafeInvoker::new(dispatcher)),
    };
    Ok(invoker)
}
