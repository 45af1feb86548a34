//! Applies registry notifications to the client runtime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use saturn_client::{ClientRuntime, CopyOnWriteGroupList};
use saturn_common::{Address, RegisterMeta, ServiceMeta};

use crate::backend::RegistryEvent;

pub type OfflineListener = Arc<dyn Fn(&Address) + Send + Sync>;

/// Tracks which services each address advertises and tells listeners when
/// an address advertises nothing any more.
///
/// Listeners stay registered; they fire every time the address goes
/// offline, including after it has come back.
#[derive(Default)]
pub struct OfflineNotifier {
    services: DashMap<Address, HashSet<ServiceMeta>>,
    listeners: DashMap<Address, Vec<OfflineListener>>,
}

impl OfflineNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, address: Address, listener: OfflineListener) {
        self.listeners.entry(address).or_default().push(listener);
    }

    pub fn is_online(&self, address: &Address) -> bool {
        self.services.get(address).is_some_and(|s| !s.is_empty())
    }

    pub(crate) fn online(&self, address: &Address, service: &ServiceMeta) {
        self.services
            .entry(address.clone())
            .or_default()
            .insert(service.clone());
    }

    /// Returns `true` if `service` was the last one at `address`.
    pub(crate) fn offline(&self, address: &Address, service: &ServiceMeta) -> bool {
        let gone = {
            let Some(mut services) = self.services.get_mut(address) else {
                return false;
            };
            services.remove(service) && services.is_empty()
        };
        if !gone {
            return false;
        }
        self.services.remove_if(address, |_, s| s.is_empty());

        // clone out so listeners can register more listeners
        let listeners: Vec<OfflineListener> = self
            .listeners
            .get(address)
            .map(|l| l.clone())
            .unwrap_or_default();
        info!(address = %address, listeners = listeners.len(), "provider offline");
        for listener in listeners {
            listener(address);
        }
        true
    }
}

#[derive(Default)]
struct LiveNodes {
    /// Node path → (arrival order, registration).
    nodes: HashMap<String, (u64, RegisterMeta)>,
    arrivals: u64,
}

impl LiveNodes {
    /// Most recently added live registration at `address`.
    fn latest(&self, address: &Address) -> Option<&RegisterMeta> {
        self.nodes
            .values()
            .filter(|(_, meta)| &meta.address == address)
            .max_by_key(|(arrival, _)| *arrival)
            .map(|(_, meta)| meta)
    }
}

/// Keeps one service's directory in step with the registry.
///
/// Membership is tracked per live node path. A provider that re-advertises
/// under a new path (a new weight, say) stays in the directory until its
/// last live node is gone, and the newest node's weight applies.
pub struct RegistrySubscriber {
    runtime: Arc<ClientRuntime>,
    service: ServiceMeta,
    directory: String,
    groups: Arc<CopyOnWriteGroupList>,
    notifier: Arc<OfflineNotifier>,
    live: Mutex<LiveNodes>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RegistrySubscriber {
    pub fn new(runtime: Arc<ClientRuntime>, service: ServiceMeta, notifier: Arc<OfflineNotifier>) -> Self {
        let directory = service.directory_string();
        let groups = runtime.table().find(&directory);
        Self {
            runtime,
            service,
            directory,
            groups,
            notifier,
            live: Mutex::new(LiveNodes::default()),
            task: Mutex::new(None),
        }
    }

    pub fn service(&self) -> &ServiceMeta {
        &self.service
    }

    /// Registrations currently applied to the directory, one per live node.
    pub fn providers(&self) -> Vec<RegisterMeta> {
        self.live
            .lock()
            .nodes
            .values()
            .map(|(_, meta)| meta.clone())
            .collect()
    }

    /// Apply one notification. Duplicates are no-ops.
    pub fn apply(&self, event: &RegistryEvent) {
        let (path, added) = match event {
            RegistryEvent::ChildAdded(path) => (path, true),
            RegistryEvent::ChildRemoved(path) => (path, false),
        };
        let meta = match RegisterMeta::from_node_path(path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %path, error = %e, "ignoring malformed registry node");
                return;
            }
        };
        if meta.service != self.service {
            return;
        }
        if added {
            self.added(path, meta);
        } else {
            self.removed(path);
        }
    }

    fn added(&self, path: &str, meta: RegisterMeta) {
        let mut live = self.live.lock();
        if live.nodes.contains_key(path) {
            return;
        }
        live.arrivals += 1;
        let arrival = live.arrivals;
        live.nodes.insert(path.to_string(), (arrival, meta.clone()));

        self.runtime.connector().attach(
            &self.groups,
            &self.directory,
            &meta.address,
            meta.connection_count,
            meta.weight,
        );
        self.notifier.online(&meta.address, &self.service);
        info!(
            directory = %self.directory,
            address = %meta.address,
            weight = meta.weight,
            "provider added"
        );
    }

    fn removed(&self, path: &str) {
        let meta = {
            let mut live = self.live.lock();
            let Some((_, meta)) = live.nodes.remove(path) else {
                return;
            };
            if let Some(latest) = live.latest(&meta.address) {
                if let Some(group) = self.runtime.connector().get(&latest.address) {
                    group.put_weight(&self.directory, latest.weight);
                }
                debug!(
                    address = %meta.address,
                    weight = latest.weight,
                    "address still advertised by another node"
                );
                return;
            }
            self.runtime
                .connector()
                .detach(&self.groups, &self.directory, &meta.address);
            meta
        };
        info!(directory = %self.directory, address = %meta.address, "provider removed");
        self.notifier.offline(&meta.address, &self.service);
    }

    /// Drop every applied node that is not in `children`.
    pub fn reconcile(&self, children: &[String]) {
        let current: HashSet<&str> = children.iter().map(String::as_str).collect();
        let stale: Vec<String> = self
            .live
            .lock()
            .nodes
            .keys()
            .filter(|path| !current.contains(path.as_str()))
            .cloned()
            .collect();
        for path in stale {
            debug!(path = %path, "dropping stale registration");
            self.removed(&path);
        }
    }

    /// Consume `events` in the background, replacing any previous stream.
    ///
    /// The task holds the subscriber weakly and ends once it is dropped.
    pub fn listen(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<RegistryEvent>) {
        let subscriber = Arc::downgrade(self);
        let directory = self.directory.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(subscriber) = subscriber.upgrade() else { return };
                subscriber.apply(&event);
            }
            debug!(directory = %directory, "registry event stream ended");
        });
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for RegistrySubscriber {
    fn drop(&mut self) {
        self.stop();
    }
}
