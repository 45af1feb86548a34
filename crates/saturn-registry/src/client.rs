//! Registration and subscription front end with reconnect-and-resync.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use saturn_client::{ClientRuntime, ConsumerConfig, ServiceClient};
use saturn_common::{Address, RegisterMeta, ServiceMeta};

use crate::backend::{BackendState, RegistryBackend};
use crate::error::{RegistryError, Result};
use crate::subscriber::{OfflineNotifier, RegistrySubscriber};

/// Remembers every registration and subscription made through it, and
/// replays all of them when the backend reports a new session.
pub struct RegistryClient {
    backend: Arc<dyn RegistryBackend>,
    runtime: Arc<ClientRuntime>,
    registrations: Mutex<HashSet<RegisterMeta>>,
    subscribers: DashMap<ServiceMeta, Arc<RegistrySubscriber>>,
    notifier: Arc<OfflineNotifier>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl RegistryClient {
    /// Must be called from within a tokio runtime.
    pub fn new(backend: Arc<dyn RegistryBackend>, runtime: Arc<ClientRuntime>) -> Arc<Self> {
        let states = backend.state_events();
        let client = Arc::new(Self {
            backend,
            runtime,
            registrations: Mutex::new(HashSet::new()),
            subscribers: DashMap::new(),
            notifier: Arc::new(OfflineNotifier::new()),
            watcher: Mutex::new(None),
        });
        let handle = tokio::spawn(watch_state(Arc::downgrade(&client), states));
        *client.watcher.lock() = Some(handle);
        client
    }

    pub fn runtime(&self) -> &Arc<ClientRuntime> {
        &self.runtime
    }

    /// Publish `meta`.
    ///
    /// The registration is remembered even if the backend is unreachable
    /// and is replayed on the next session.
    pub async fn register(&self, meta: RegisterMeta) -> Result<()> {
        self.registrations.lock().insert(meta.clone());
        self.backend.register(&meta).await?;
        info!(path = %meta.node_path(self.backend.namespace()), "registered");
        Ok(())
    }

    pub async fn unregister(&self, meta: &RegisterMeta) -> Result<()> {
        self.registrations.lock().remove(meta);
        self.backend.unregister(meta).await?;
        info!(path = %meta.node_path(self.backend.namespace()), "unregistered");
        Ok(())
    }

    /// Track the providers of `service`. Subscribing twice returns the
    /// existing subscriber.
    pub async fn subscribe(&self, service: ServiceMeta) -> Result<Arc<RegistrySubscriber>> {
        if let Some(existing) = self.subscribers.get(&service) {
            return Ok(existing.clone());
        }

        let subscriber = Arc::new(RegistrySubscriber::new(
            self.runtime.clone(),
            service.clone(),
            self.notifier.clone(),
        ));
        let events = self.backend.subscribe(&service).await?;

        let subscriber = self
            .subscribers
            .entry(service.clone())
            .or_insert_with(|| {
                subscriber.listen(events);
                subscriber
            })
            .clone();
        info!(service = %service, "subscribed");
        Ok(subscriber)
    }

    /// Subscribe to `service` and build a client over its directory.
    pub async fn service_client(&self, service: ServiceMeta, config: ConsumerConfig) -> Result<ServiceClient> {
        self.subscribe(service.clone()).await?;
        let client = self.runtime.client(service).config(config).build().await?;
        Ok(client)
    }

    /// Call `listener` whenever `address` stops advertising any
    /// subscribed service.
    pub fn on_offline(&self, address: Address, listener: impl Fn(&Address) + Send + Sync + 'static) {
        self.notifier.add_listener(address, Arc::new(listener));
    }

    pub fn registrations(&self) -> Vec<RegisterMeta> {
        self.registrations.lock().iter().cloned().collect()
    }

    pub fn subscriptions(&self) -> Vec<ServiceMeta> {
        self.subscribers.iter().map(|e| e.key().clone()).collect()
    }

    /// Recreate every registration and watch on the current session.
    ///
    /// Providers that vanished while the session was down are dropped
    /// before the watch is re-established.
    pub async fn resync(&self) -> Result<()> {
        let registrations = self.registrations();
        for meta in &registrations {
            match self.backend.register(meta).await {
                Ok(()) | Err(RegistryError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let subscribers: Vec<Arc<RegistrySubscriber>> =
            self.subscribers.iter().map(|e| e.value().clone()).collect();
        for subscriber in &subscribers {
            let children = self.backend.children(subscriber.service()).await?;
            subscriber.reconcile(&children);
            let events = self.backend.subscribe(subscriber.service()).await?;
            subscriber.listen(events);
        }

        info!(
            registrations = registrations.len(),
            subscriptions = subscribers.len(),
            "registry state resynced"
        );
        Ok(())
    }

    /// Stop watching the backend and every subscription.
    pub fn shutdown(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        for entry in self.subscribers.iter() {
            entry.value().stop();
        }
    }
}

impl Drop for RegistryClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn watch_state(
    client: Weak<RegistryClient>,
    mut states: tokio::sync::broadcast::Receiver<BackendState>,
) {
    loop {
        let state = match states.recv().await {
            Ok(state) => state,
            Err(RecvError::Lagged(skipped)) => {
                // a missed Reconnected would leave stale watches
                warn!(skipped, "registry state events lagged, resyncing");
                BackendState::Reconnected
            }
            Err(RecvError::Closed) => break,
        };
        let Some(client) = client.upgrade() else { break };
        match state {
            BackendState::Connected => debug!("registry connected"),
            BackendState::Disconnected => warn!("registry session lost"),
            BackendState::Reconnected => {
                if let Err(e) = client.resync().await {
                    error!(error = %e, "registry resync failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRegistry, MemorySession};
    use saturn_client::RuntimeConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn service() -> ServiceMeta {
        ServiceMeta::new("test", "1.0.0", "EchoService")
    }

    fn meta(port: u16) -> RegisterMeta {
        RegisterMeta::new(Address::new("127.0.0.1", port), service())
    }

    fn client(session: &Arc<MemorySession>) -> Arc<RegistryClient> {
        let runtime = ClientRuntime::new(RuntimeConfig::default()).unwrap();
        RegistryClient::new(session.clone() as Arc<dyn RegistryBackend>, runtime)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_registrations_replayed_after_reconnect() {
        let registry = MemoryRegistry::new();
        let session = registry.session();
        let client = client(&session);

        client.register(meta(1)).await.unwrap();
        assert_eq!(registry.nodes().len(), 1);

        session.expire();
        assert!(registry.nodes().is_empty());
        assert!(matches!(
            client.register(meta(2)).await,
            Err(RegistryError::Disconnected)
        ));

        session.restore();
        assert!(eventually(|| registry.nodes().len() == 2).await);
        assert_eq!(client.registrations().len(), 2);
    }

    #[tokio::test]
    async fn test_unregister_forgets_registration() {
        let registry = MemoryRegistry::new();
        let session = registry.session();
        let client = client(&session);

        client.register(meta(1)).await.unwrap();
        client.unregister(&meta(1)).await.unwrap();
        assert!(client.registrations().is_empty());

        session.expire();
        session.restore();
        client.resync().await.unwrap();
        assert!(registry.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let registry = MemoryRegistry::new();
        let client = client(&registry.session());

        let a = client.subscribe(service()).await.unwrap();
        let b = client.subscribe(service()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(client.subscriptions(), vec![service()]);
    }

    #[tokio::test]
    async fn test_resync_drops_providers_lost_while_down() {
        let registry = MemoryRegistry::new();
        let provider = registry.session();
        provider.register(&meta(1)).await.unwrap();
        provider.register(&meta(2)).await.unwrap();

        let consumer = registry.session();
        let client = client(&consumer);
        let subscriber = client.subscribe(service()).await.unwrap();
        assert!(eventually(|| subscriber.providers().len() == 2).await);

        consumer.expire();
        provider.unregister(&meta(1)).await.unwrap();
        provider.register(&meta(3)).await.unwrap();
        consumer.restore();

        assert!(
            eventually(|| {
                let mut ports: Vec<u16> = subscriber.providers().iter().map(|m| m.address.port()).collect();
                ports.sort();
                ports == vec![2, 3]
            })
            .await
        );
        let directory = client.runtime().table().find(&service().directory_string());
        assert_eq!(directory.len(), 2);
        assert!(!directory.contains(&Address::new("127.0.0.1", 1)));
    }

    #[tokio::test]
    async fn test_offline_listener_fires_on_provider_expiry() {
        let registry = MemoryRegistry::new();
        let provider = registry.session();
        provider.register(&meta(1)).await.unwrap();

        let client = client(&registry.session());
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            client.on_offline(Address::new("127.0.0.1", 1), move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        let subscriber = client.subscribe(service()).await.unwrap();
        assert!(eventually(|| subscriber.providers().len() == 1).await);

        provider.expire();
        assert!(eventually(|| fired.load(Ordering::SeqCst) == 1).await);
        assert!(subscriber.providers().is_empty());
    }
}
