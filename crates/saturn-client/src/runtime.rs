//! Per-process client context.
//!
//! Everything a call needs that outlives the call: the correlation map and
//! its timeout scanner, the directory table, the connector, the callback
//! executor and metrics. Several runtimes can coexist; nothing here is
//! global.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use saturn_common::{Result, ServiceMeta};
use saturn_metrics::{InvocationMetrics, InvocationSnapshot};

use crate::channel::ChannelFactory;
use crate::client::ServiceClientBuilder;
use crate::config::RuntimeConfig;
use crate::connector::Connector;
use crate::directory::DirectoryGroupTable;
use crate::executor::{CallbackExecutor, TokioExecutor, WorkerPoolExecutor};
use crate::future::FutureRegistry;
use crate::tcp::{TcpChannelFactory, TcpOptions};

/// Period of the lost-group reclaimer.
const RECLAIM_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the callback queue when a worker pool is configured.
const CALLBACK_QUEUE_CAPACITY: usize = 1024;

pub struct ClientRuntime {
    config: RuntimeConfig,
    futures: Arc<FutureRegistry>,
    table: Arc<DirectoryGroupTable>,
    connector: Arc<Connector>,
    executor: Arc<dyn CallbackExecutor>,
    metrics: Arc<InvocationMetrics>,
    invoke_ids: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientRuntime {
    /// Creates a runtime connecting over TCP.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>> {
        let options = TcpOptions::from(&config);
        Self::with_channel_factory(config, move |futures| {
            Arc::new(TcpChannelFactory::new(futures, options)) as Arc<dyn ChannelFactory>
        })
    }

    /// Creates a runtime whose connections come from `make_factory`.
    ///
    /// # Arguments
    /// * `config` - Runtime settings
    /// * `make_factory` - Builds the channel factory; receives the registry
    ///   responses must be routed into
    pub fn with_channel_factory<F>(config: RuntimeConfig, make_factory: F) -> Result<Arc<Self>>
    where
        F: FnOnce(Arc<FutureRegistry>) -> Arc<dyn ChannelFactory>,
    {
        config.validate()?;

        let executor: Arc<dyn CallbackExecutor> = match config.callback_workers {
            Some(workers) => Arc::new(WorkerPoolExecutor::new(workers, CALLBACK_QUEUE_CAPACITY)?),
            None => Arc::new(TokioExecutor::current()?),
        };

        let futures = Arc::new(FutureRegistry::new());
        let table = Arc::new(DirectoryGroupTable::new());
        let factory = make_factory(futures.clone());
        let connector = Arc::new(Connector::new(factory, table.clone(), config.clone()));

        let scanner = futures.spawn_scanner(config.scan_interval());
        let reclaimer = {
            let connector = connector.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(RECLAIM_INTERVAL);
                loop {
                    ticker.tick().await;
                    let reclaimed = connector.reclaim_lost_groups();
                    if reclaimed > 0 {
                        info!(reclaimed, "reclaimed lost channel groups");
                    }
                }
            })
        };

        debug!(?config, "client runtime started");
        Ok(Arc::new(Self {
            config,
            futures,
            table,
            connector,
            executor,
            metrics: Arc::new(InvocationMetrics::new()),
            invoke_ids: AtomicU64::new(1),
            tasks: Mutex::new(vec![scanner, reclaimer]),
        }))
    }

    /// Start building a client for `service`.
    pub fn client(self: &Arc<Self>, service: ServiceMeta) -> ServiceClientBuilder {
        ServiceClientBuilder::new(self.clone(), service)
    }

    pub fn next_invoke_id(&self) -> u64 {
        self.invoke_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn futures(&self) -> &Arc<FutureRegistry> {
        &self.futures
    }

    pub fn table(&self) -> &Arc<DirectoryGroupTable> {
        &self.table
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    pub fn executor(&self) -> &Arc<dyn CallbackExecutor> {
        &self.executor
    }

    pub fn metrics(&self) -> &Arc<InvocationMetrics> {
        &self.metrics
    }

    pub fn metrics_snapshot(&self) -> InvocationSnapshot {
        self.metrics.snapshot()
    }

    /// Stop background tasks and close every connection.
    pub fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            task.abort();
        }
        self.connector.shutdown();
        info!("client runtime stopped");
    }
}

impl Drop for ClientRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Task;
    use saturn_common::Address;

    #[tokio::test]
    async fn test_invoke_ids_are_unique() {
        let runtime = ClientRuntime::new(RuntimeConfig::default()).unwrap();
        let a = runtime.next_invoke_id();
        let b = runtime.next_invoke_id();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = RuntimeConfig {
            scan_interval_ms: 0,
            ..RuntimeConfig::default()
        };
        assert!(ClientRuntime::new(config).is_err());
    }

    #[test]
    fn test_requires_tokio_without_worker_pool() {
        assert!(ClientRuntime::new(RuntimeConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_worker_pool_executor_configured() {
        let config = RuntimeConfig {
            callback_workers: Some(2),
            ..RuntimeConfig::default()
        };
        let runtime = ClientRuntime::new(config).unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let task: Task = Box::new(move || {
            let _ = tx.send(std::thread::current().name().map(str::to_string));
        });
        runtime.executor().execute(task);
        let name = rx.await.unwrap().unwrap_or_default();
        assert!(name.starts_with("saturn-callback-"), "ran on {}", name);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let runtime = ClientRuntime::new(RuntimeConfig::default()).unwrap();
        let address = Address::new("127.0.0.1", 1);
        runtime.connector().group(&address);
        assert_eq!(runtime.connector().addresses().len(), 1);

        runtime.shutdown();
        assert!(runtime.connector().addresses().is_empty());
        runtime.shutdown();
    }
}
