// Integration tests for saturn-registry
//
// Providers run on loopback TCP and advertise themselves through a shared
// in-memory registry; consumers discover them only through subscriptions.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use saturn_client::{ClientRuntime, ConsumerConfig, RuntimeConfig, ServiceClient};
use saturn_common::{SaturnError, ServiceMeta};
use saturn_registry::{MemoryRegistry, MemorySession, RegistryBackend, RegistryClient, RegistryError};
use serde_json::json;

use support::{eventually, init_tracing, EchoProvider};

// ============================================================================
// Test Helpers
// ============================================================================

fn service() -> ServiceMeta {
    ServiceMeta::new("test", "1.0.0", "EchoService")
}

fn registry_client(session: &Arc<MemorySession>) -> Arc<RegistryClient> {
    init_tracing();
    let runtime = ClientRuntime::new(RuntimeConfig {
        warm_up_ms: 0,
        ..RuntimeConfig::default()
    })
    .unwrap();
    RegistryClient::new(session.clone() as Arc<dyn RegistryBackend>, runtime)
}

async fn consumer(registry: &Arc<MemoryRegistry>) -> (Arc<RegistryClient>, ServiceClient) {
    let registry_client = registry_client(&registry.session());
    let client = registry_client
        .service_client(service(), ConsumerConfig::default())
        .await
        .unwrap();
    (registry_client, client)
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn test_call_provider_found_through_registry() {
    let registry = MemoryRegistry::new();
    let provider = EchoProvider::start().await;
    registry
        .session()
        .register(&provider.register_meta(&service()))
        .await
        .unwrap();

    let (_registry_client, client) = consumer(&registry).await;
    assert_eq!(client.providers(), vec![provider.address()]);
    assert_eq!(client.call("echo", vec![json!("hi")]).await.unwrap(), json!("hi"));
    assert_eq!(provider.requests(), 1);
}

#[tokio::test]
async fn test_build_fails_without_registered_providers() {
    let registry = MemoryRegistry::new();
    let registry_client = registry_client(&registry.session());
    let config = ConsumerConfig {
        wait_for_available_ms: 100,
        ..ConsumerConfig::default()
    };

    let result = registry_client.service_client(service(), config).await;
    assert!(matches!(
        result,
        Err(RegistryError::Saturn(SaturnError::ConnectFailed(_)))
    ));
}

#[tokio::test]
async fn test_new_provider_joins_rotation() {
    let registry = MemoryRegistry::new();
    let provider_session = registry.session();
    let a = EchoProvider::start().await;
    provider_session.register(&a.register_meta(&service())).await.unwrap();
    let (registry_client, client) = consumer(&registry).await;

    let b = EchoProvider::start().await;
    provider_session.register(&b.register_meta(&service())).await.unwrap();
    let runtime = registry_client.runtime().clone();
    let b_address = b.address();
    assert!(
        eventually(Duration::from_secs(5), || {
            runtime
                .connector()
                .get(&b_address)
                .is_some_and(|g| g.is_available())
        })
        .await
    );

    for i in 0..10 {
        assert_eq!(client.call("echo", vec![json!(i)]).await.unwrap(), json!(i));
    }
    assert!(a.requests() > 0);
    assert!(b.requests() > 0);
    assert_eq!(a.requests() + b.requests(), 10);
}

#[tokio::test]
async fn test_unregistered_provider_leaves_rotation() {
    let registry = MemoryRegistry::new();
    let provider_session = registry.session();
    let a = EchoProvider::start().await;
    let b = EchoProvider::start().await;
    provider_session.register(&a.register_meta(&service())).await.unwrap();
    provider_session.register(&b.register_meta(&service())).await.unwrap();
    let (registry_client, client) = consumer(&registry).await;
    assert!(eventually(Duration::from_secs(5), || client.providers().len() == 2).await);

    provider_session.unregister(&a.register_meta(&service())).await.unwrap();
    assert!(eventually(Duration::from_secs(5), || client.providers() == vec![b.address()]).await);
    assert!(registry_client.runtime().connector().get(&a.address()).is_none());

    let before = a.requests();
    for i in 0..5 {
        client.call("echo", vec![json!(i)]).await.unwrap();
    }
    assert_eq!(a.requests(), before);
}

// ============================================================================
// Session Loss
// ============================================================================

#[tokio::test]
async fn test_provider_session_loss_and_recovery() {
    let registry = MemoryRegistry::new();
    let provider_session = registry.session();
    let provider_registry = registry_client(&provider_session);
    let provider = EchoProvider::start().await;
    provider_registry
        .register(provider.register_meta(&service()))
        .await
        .unwrap();

    let (registry_client, client) = consumer(&registry).await;
    let offline = Arc::new(AtomicUsize::new(0));
    {
        let offline = offline.clone();
        registry_client.on_offline(provider.address(), move |_| {
            offline.fetch_add(1, Ordering::SeqCst);
        });
    }

    provider_session.expire();
    assert!(eventually(Duration::from_secs(5), || offline.load(Ordering::SeqCst) == 1).await);
    assert!(client.providers().is_empty());

    // the provider's registry client re-registers on the new session
    provider_session.restore();
    assert!(eventually(Duration::from_secs(5), || client.providers() == vec![provider.address()]).await);
    let runtime = registry_client.runtime().clone();
    let address = provider.address();
    assert!(
        eventually(Duration::from_secs(5), || {
            runtime.connector().get(&address).is_some_and(|g| g.is_available())
        })
        .await
    );
    assert_eq!(client.call("echo", vec![json!(7)]).await.unwrap(), json!(7));
}

#[tokio::test]
async fn test_consumer_session_loss_resubscribes() {
    let registry = MemoryRegistry::new();
    let provider_session = registry.session();
    let a = EchoProvider::start().await;
    provider_session.register(&a.register_meta(&service())).await.unwrap();

    let consumer_session = registry.session();
    let registry_client = registry_client(&consumer_session);
    let client = registry_client
        .service_client(service(), ConsumerConfig::default())
        .await
        .unwrap();

    consumer_session.expire();
    let b = EchoProvider::start().await;
    provider_session.register(&b.register_meta(&service())).await.unwrap();
    consumer_session.restore();

    assert!(eventually(Duration::from_secs(5), || client.providers().len() == 2).await);
    assert_eq!(registry_client.subscriptions(), vec![service()]);
}
