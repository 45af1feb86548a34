//! Consumer-facing service client.
//!
//! A [`ServiceClient`] is the explicit replacement for a generated proxy:
//! typed stubs wrap it and forward each method to [`ServiceClient::call`].
//!
//! ```no_run
//! use saturn_client::{ClientRuntime, RuntimeConfig, ServiceClient};
//! use saturn_common::{Address, Result, ServiceMeta};
//! use serde_json::json;
//!
//! struct EchoStub {
//!     client: ServiceClient,
//! }
//!
//! impl EchoStub {
//!     async fn echo(&self, text: &str) -> Result<String> {
//!         self.client.call_typed("echo", vec![json!(text)]).await
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let runtime = ClientRuntime::new(RuntimeConfig::default())?;
//! let client = runtime
//!     .client(ServiceMeta::new("test", "1.0.0", "EchoService"))
//!     .provider(Address::new("127.0.0.1", 18090))
//!     .build()
//!     .await?;
//! let stub = EchoStub { client };
//! assert_eq!(stub.echo("hi").await?, "hi");
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use saturn_common::{Address, MethodCall, Result, SaturnError, ServiceMeta, DEFAULT_WEIGHT};
use saturn_metrics::Outcome;

use crate::cluster::{cluster_invoker, ClusterInvoker};
use crate::config::{ConsumerConfig, DispatchMode};
use crate::directory::CopyOnWriteGroupList;
use crate::dispatcher::{
    BroadcastDispatcher, DispatchContext, Dispatcher, Invocation, RoundDispatcher,
};
use crate::load_balancer::load_balancer;
use crate::runtime::ClientRuntime;

/// Longest single wait while polling a directory for an available provider.
const AVAILABILITY_POLL: Duration = Duration::from_millis(50);

pub struct ServiceClientBuilder {
    runtime: Arc<ClientRuntime>,
    service: ServiceMeta,
    config: ConsumerConfig,
    providers: Vec<(Address, u32)>,
}

impl ServiceClientBuilder {
    pub(crate) fn new(runtime: Arc<ClientRuntime>, service: ServiceMeta) -> Self {
        Self {
            runtime,
            service,
            config: ConsumerConfig::default(),
            providers: Vec::new(),
        }
    }

    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a statically configured provider with the default weight.
    pub fn provider(self, address: Address) -> Self {
        self.weighted_provider(address, DEFAULT_WEIGHT)
    }

    pub fn weighted_provider(mut self, address: Address, weight: u32) -> Self {
        self.providers.push((address, weight));
        self
    }

    pub fn providers(mut self, addresses: impl IntoIterator<Item = Address>) -> Self {
        self.providers
            .extend(addresses.into_iter().map(|a| (a, DEFAULT_WEIGHT)));
        self
    }

    /// Connect to the static providers and wait until one is usable.
    ///
    /// With no static providers the directory is expected to be filled by a
    /// registry subscription. Either way the build fails with
    /// [`SaturnError::ConnectFailed`] if no provider of the directory
    /// becomes available within `wait_for_available_ms`.
    pub async fn build(self) -> Result<ServiceClient> {
        self.config.validate()?;

        let directory = self.service.directory_string();
        let groups = self.runtime.table().find(&directory);

        for (address, weight) in &self.providers {
            self.runtime.connector().attach(
                &groups,
                &directory,
                address,
                self.config.connection_count,
                *weight,
            );
        }

        let context = DispatchContext {
            groups: groups.clone(),
            serializer: self.config.serializer.serializer(),
            futures: self.runtime.futures().clone(),
            metrics: self.runtime.metrics().clone(),
        };
        let dispatcher: Arc<dyn Dispatcher> = match self.config.dispatch {
            DispatchMode::Round => Arc::new(RoundDispatcher::new(
                context,
                load_balancer(self.config.load_balancer),
            )),
            DispatchMode::Broadcast => Arc::new(BroadcastDispatcher::new(context)),
        };
        let invoker = cluster_invoker(
            self.config.cluster,
            self.config.retries,
            dispatcher,
            self.runtime.metrics().clone(),
        )?;

        let wait = self.config.wait_for_available();
        if !wait_for_any_available(&groups, wait).await {
            return Err(SaturnError::ConnectFailed(format!(
                "no provider of {} became available within {}ms",
                directory,
                wait.as_millis()
            )));
        }

        info!(
            directory = %directory,
            providers = groups.len(),
            cluster = ?self.config.cluster,
            "service client ready"
        );
        Ok(ServiceClient {
            inner: Arc::new(Inner {
                runtime: self.runtime,
                service: self.service,
                directory,
                config: self.config,
                groups,
                invoker,
            }),
        })
    }
}

/// Wait until any group of the directory has a live channel.
///
/// Groups may be added while waiting, so the snapshot is re-read at least
/// every [`AVAILABILITY_POLL`].
async fn wait_for_any_available(groups: &CopyOnWriteGroupList, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let snapshot = groups.snapshot();
        if snapshot.iter().any(|g| g.is_available()) {
            return true;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        let slice = remaining.min(AVAILABILITY_POLL);
        if snapshot.is_empty() {
            tokio::time::sleep(slice).await;
        } else {
            let waits = snapshot.iter().map(|group| {
                Box::pin(async move {
                    if group.wait_for_available(slice).await {
                        Ok(())
                    } else {
                        Err(())
                    }
                })
            });
            let _ = futures::future::select_ok(waits).await;
        }
    }
}

struct Inner {
    runtime: Arc<ClientRuntime>,
    service: ServiceMeta,
    directory: String,
    config: ConsumerConfig,
    groups: Arc<CopyOnWriteGroupList>,
    invoker: Arc<dyn ClusterInvoker>,
}

/// Handle for calling one service. Cheap to clone.
#[derive(Clone)]
pub struct ServiceClient {
    inner: Arc<Inner>,
}

impl ServiceClient {
    pub fn service(&self) -> &ServiceMeta {
        &self.inner.service
    }

    pub fn directory(&self) -> &str {
        &self.inner.directory
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    /// Addresses currently serving this client's directory.
    pub fn providers(&self) -> Vec<Address> {
        self.inner
            .groups
            .snapshot()
            .iter()
            .map(|g| g.address().clone())
            .collect()
    }

    /// Call `method` and wait for its result.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let inner = &self.inner;
        let invocation = Invocation {
            invoke_id: inner.runtime.next_invoke_id(),
            call: MethodCall::new(inner.service.service_provider_name.clone(), method, args),
            directory: inner.directory.clone(),
        };

        let start = Instant::now();
        let result = inner.invoker.invoke(&invocation, inner.config.timeout()).await;
        let latency_us = start.elapsed().as_micros() as u64;

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(e) if e.root_cause().is_biz() => Outcome::BizError,
            Err(e) if e.timeout_kind().is_some() => Outcome::Timeout,
            Err(_) => Outcome::Failure,
        };
        inner.runtime.metrics().record_invocation(method, latency_us, outcome);

        if let Err(e) = &result {
            debug!(invoke_id = invocation.invoke_id, method, error = %e, "call failed");
        }
        result
    }

    /// Call `method` and deserialize the result into `T`.
    pub async fn call_typed<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Call `method` without waiting; `listener` receives the result on the
    /// runtime's callback executor.
    pub fn call_with_listener<F>(&self, method: &str, args: Vec<Value>, listener: F)
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let client = self.clone();
        let method = method.to_string();
        tokio::spawn(async move {
            let result = client.call(&method, args).await;
            client
                .inner
                .runtime
                .executor()
                .execute(Box::new(move || listener(result)));
        });
    }
}
