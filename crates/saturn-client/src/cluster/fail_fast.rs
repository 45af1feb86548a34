use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use saturn_common::Result;

use super::ClusterInvoker;
use crate::config::ClusterStrategy;
use crate::dispatcher::{Dispatcher, Invocation};

/// One attempt; any failure is returned as is.
pub struct FailFastInvoker {
    dispatcher: Arc<dyn Dispatcher>,
}

impl FailFastInvoker {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl ClusterInvoker for FailFastInvoker {
    fn strategy(&self) -> ClusterStrategy {
        ClusterStrategy::FailFast
    }

    async fn invoke(&self, invocation: &Invocation, timeout: Duration) -> Result<Value> {
        self.dispatcher
            .dispatch(invocation, timeout, &mut Vec::new())
            .await
    }
}
