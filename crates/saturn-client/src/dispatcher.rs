//! Sending one attempt of a call.
//!
//! A dispatcher picks the target group(s), writes the request frame, waits on
//! the registered [`InvokeFuture`] and decodes the response body. Retry
//! policy lives one layer up, in the cluster invokers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, trace};

use saturn_common::serializer::serializer_for_code;
use saturn_common::{
    Address, Message, MethodCall, RequestFrame, ResponseFrame, Result, SaturnError, Serializer,
    Status, TimeoutKind,
};
use saturn_metrics::InvocationMetrics;

use crate::directory::CopyOnWriteGroupList;
use crate::future::{FutureRegistry, InvokeFuture};
use crate::group::ChannelGroup;
use crate::load_balancer::LoadBalancer;

/// One logical call.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub invoke_id: u64,
    pub call: MethodCall,
    /// Directory string of the target service.
    pub directory: String,
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Send one attempt and wait for its result.
    ///
    /// `tried` holds the addresses earlier attempts of the same call went to;
    /// unicast dispatch appends the address it picks.
    async fn dispatch(
        &self,
        invocation: &Invocation,
        timeout: Duration,
        tried: &mut Vec<Address>,
    ) -> Result<Value>;

    fn is_broadcast(&self) -> bool;
}

/// What both dispatchers need to put a frame on the wire.
#[derive(Clone)]
pub struct DispatchContext {
    pub groups: Arc<CopyOnWriteGroupList>,
    pub serializer: Arc<dyn Serializer>,
    pub futures: Arc<FutureRegistry>,
    pub metrics: Arc<InvocationMetrics>,
}

impl DispatchContext {
    fn encode(&self, call: &MethodCall) -> Result<Bytes> {
        Ok(Bytes::from(self.serializer.encode_call(call)?))
    }

    /// Write `body` on the next channel of `group` and wait for the answer.
    async fn send(
        &self,
        group: &ChannelGroup,
        invoke_id: u64,
        body: Bytes,
        timeout: Duration,
        broadcast: bool,
    ) -> Result<Value> {
        let started = Instant::now();
        let address = group.address().clone();
        let channel = match group.next(timeout).await {
            Ok(channel) => channel,
            Err(_) if started.elapsed() >= timeout => {
                return Err(SaturnError::Timeout {
                    kind: TimeoutKind::Client,
                    invoke_id,
                    timeout_ms: timeout.as_millis() as u64,
                    address: Some(address),
                });
            }
            Err(e) => return Err(e),
        };
        let timeout = timeout.saturating_sub(started.elapsed());

        let future = if broadcast {
            InvokeFuture::broadcast(invoke_id, channel.id(), address.clone(), timeout)
        } else {
            InvokeFuture::new(invoke_id, channel.id(), address.clone(), timeout)
        };
        let future = Arc::new(future);
        self.futures.register(future.clone());

        let frame = RequestFrame::new(invoke_id, self.serializer.code(), body);
        let sent = future.clone();
        let futures = self.futures.clone();
        channel.write(
            Message::Request(frame),
            Box::new(move |result| match result {
                Ok(()) => sent.mark_sent(),
                Err(e) => {
                    futures.fail(&sent, e);
                }
            }),
        );
        self.metrics.record_provider_request(&address.to_string());
        trace!(invoke_id, address = %address, channel_id = channel.id(), "request written");

        let response = future.wait().await?;
        decode_response(&response, &self.serializer, &address)
    }
}

/// Turn a response frame into a call result.
///
/// The body is decoded with the serializer named in the frame, falling back
/// to `fallback` when the code is unknown.
pub fn decode_response(
    response: &ResponseFrame,
    fallback: &Arc<dyn Serializer>,
    address: &Address,
) -> Result<Value> {
    let serializer = serializer_for_code(response.serializer_code).unwrap_or_else(|_| fallback.clone());

    let error_message = || -> String {
        if response.body.is_empty() {
            return response.status.name().to_string();
        }
        serializer
            .decode_result(&response.body)
            .ok()
            .and_then(|wrapper| wrapper.error)
            .unwrap_or_else(|| response.status.name().to_string())
    };

    match response.status {
        Status::Ok => {
            let wrapper = serializer.decode_result(&response.body)?;
            match wrapper.error {
                Some(message) => Err(SaturnError::Biz {
                    address: address.clone(),
                    message,
                }),
                None => Ok(wrapper.result.unwrap_or(Value::Null)),
            }
        }
        Status::ServiceExpectedError => Err(SaturnError::Biz {
            address: address.clone(),
            message: error_message(),
        }),
        status => Err(SaturnError::Remote {
            address: address.clone(),
            status,
            message: error_message(),
        }),
    }
}

/// Unicast: one group chosen by the load balancer.
pub struct RoundDispatcher {
    context: DispatchContext,
    load_balancer: Arc<dyn LoadBalancer>,
}

impl RoundDispatcher {
    pub fn new(context: DispatchContext, load_balancer: Arc<dyn LoadBalancer>) -> Self {
        Self {
            context,
            load_balancer,
        }
    }

    fn select(&self, directory: &str, tried: &[Address]) -> Result<Arc<ChannelGroup>> {
        let snapshot = self.context.groups.snapshot();
        if tried.is_empty() {
            return self.load_balancer.select(&snapshot, directory);
        }

        let untried: Vec<Arc<ChannelGroup>> = snapshot
            .iter()
            .filter(|g| g.is_available() && !tried.contains(g.address()))
            .cloned()
            .collect();
        if untried.is_empty() {
            self.load_balancer.select(&snapshot, directory)
        } else {
            self.load_balancer.select(&untried, directory)
        }
    }
}

#[async_trait]
impl Dispatcher for RoundDispatcher {
    async fn dispatch(
        &self,
        invocation: &Invocation,
        timeout: Duration,
        tried: &mut Vec<Address>,
    ) -> Result<Value> {
        let group = self.select(&invocation.directory, tried)?;
        tried.push(group.address().clone());

        let body = self.context.encode(&invocation.call)?;
        self.context
            .send(&group, invocation.invoke_id, body, timeout, false)
            .await
    }

    fn is_broadcast(&self) -> bool {
        false
    }
}

/// Every available group of the directory, results collected in snapshot
/// order. The first failing branch fails the call.
pub struct BroadcastDispatcher {
    context: DispatchContext,
}

impl BroadcastDispatcher {
    pub fn new(context: DispatchContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Dispatcher for BroadcastDispatcher {
    async fn dispatch(
        &self,
        invocation: &Invocation,
        timeout: Duration,
        _tried: &mut Vec<Address>,
    ) -> Result<Value> {
        let groups: Vec<Arc<ChannelGroup>> = self
            .context
            .groups
            .snapshot()
            .iter()
            .filter(|g| g.is_available())
            .cloned()
            .collect();
        if groups.is_empty() {
            return Err(SaturnError::NoAvailableProvider(invocation.directory.clone()));
        }

        let body = self.context.encode(&invocation.call)?;
        debug!(invoke_id = invocation.invoke_id, branches = groups.len(), "broadcasting");

        let branches = groups.iter().map(|group| {
            self.context
                .send(group, invocation.invoke_id, body.clone(), timeout, true)
        });
        let results = futures::future::try_join_all(branches).await?;
        Ok(Value::Array(results))
    }

    fn is_broadcast(&self) -> bool {
        true
    }
}
