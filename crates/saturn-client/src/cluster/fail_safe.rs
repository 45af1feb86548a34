use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use saturn_common::Result;

use super::ClusterInvoker;
use crate::config::ClusterStrategy;
use crate::dispatcher::{Dispatcher, Invocation};

/// One attempt; a failure is logged and replaced by an empty result.
pub struct FailSafeInvoker {
    dispatcher: Arc<dyn Dispatcher>,
}

impl FailSafeInvoker {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl ClusterInvoker for FailSafeInvoker {
    fn strategy(&self) -> ClusterStrategy {
        ClusterStrategy::FailSafe
    }

    async fn invoke(&self, invocation: &Invocation, timeout: Duration) -> Result<Value> {
        match self
            .dispatcher
            .dispatch(invocation, timeout, &mut Vec::new())
            .await
        {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(
                    invoke_id = invocation.invoke_id,
                    method = %invocation.call.method,
                    error = %e,
                    "call failed, returning empty result"
                );
                Ok(Value::Null)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::{fixture, invocation, respond};
    use crate::dispatcher::RoundDispatcher;
    use crate::load_balancer::RoundRobinLoadBalancer;
    use saturn_common::{ResultWrapper, Status};
    use serde_json::json;

    fn invoker(f: &crate::dispatcher::tests::Fixture) -> FailSafeInvoker {
        FailSafeInvoker::new(Arc::new(RoundDispatcher::new(
            f.context.clone(),
            Arc::new(RoundRobinLoadBalancer::new()),
        )))
    }

    #[tokio::test]
    async fn test_failures_become_empty_results() {
        for (status, wrapper) in [
            (Status::ServerError, ResultWrapper::err("down")),
            (Status::ServiceExpectedError, ResultWrapper::err("rejected")),
        ] {
            let f = fixture(1);
            respond(&f.channels[0], &f.context.futures, status, wrapper);
            let value = invoker(&f)
                .invoke(&invocation(1), Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(value, Value::Null);
        }
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let f = fixture(1);
        respond(&f.channels[0], &f.context.futures, Status::Ok, ResultWrapper::ok(json!(3)));
        let value = invoker(&f)
            .invoke(&invocation(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value, json!(3));
    }
}
