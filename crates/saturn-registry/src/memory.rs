//! In-process registry backend.
//!
//! [`MemoryRegistry`] plays the coordination service: one shared node tree.
//! Each participant talks to it through its own [`MemorySession`], which
//! owns the ephemeral nodes it created. Expiring a session deletes those
//! nodes (other sessions' watchers see the removals) and drops the session's
//! watches, as a real coordination service would.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use saturn_common::{RegisterMeta, ServiceMeta, DEFAULT_NAMESPACE};

use crate::backend::{BackendState, RegistryBackend, RegistryEvent};
use crate::error::{RegistryError, Result};

const STATE_CHANNEL_CAPACITY: usize = 16;

struct Watcher {
    session: u64,
    parent: String,
    sender: mpsc::UnboundedSender<RegistryEvent>,
}

#[derive(Default)]
struct Tree {
    /// Node path → owning session.
    nodes: BTreeMap<String, u64>,
    watchers: Vec<Watcher>,
}

impl Tree {
    fn notify(&mut self, path: &str, event: RegistryEvent) {
        let Some((parent, _)) = path.rsplit_once('/') else {
            return;
        };
        self.watchers.retain(|w| {
            if w.parent != parent {
                return true;
            }
            w.sender.send(event.clone()).is_ok()
        });
    }

    fn children(&self, parent: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|path| matches!(path.rsplit_once('/'), Some((p, _)) if p == parent))
            .cloned()
            .collect()
    }
}

/// Shared node tree.
pub struct MemoryRegistry {
    namespace: String,
    tree: Mutex<Tree>,
    next_session: AtomicU64,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Self::with_namespace(DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(namespace: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            namespace: namespace.into(),
            tree: Mutex::new(Tree::default()),
            next_session: AtomicU64::new(1),
        })
    }

    /// Open a new session.
    pub fn session(self: &Arc<Self>) -> Arc<MemorySession> {
        let (states, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Arc::new(MemorySession {
            registry: self.clone(),
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            connected: AtomicBool::new(true),
            states,
        })
    }

    /// Every node path in the tree.
    pub fn nodes(&self) -> Vec<String> {
        self.tree.lock().nodes.keys().cloned().collect()
    }
}

/// One participant's connection to a [`MemoryRegistry`].
pub struct MemorySession {
    registry: Arc<MemoryRegistry>,
    id: u64,
    connected: AtomicBool,
    states: broadcast::Sender<BackendState>,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Lose the session: delete its nodes, drop its watches.
    pub fn expire(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let mut tree = self.registry.tree.lock();
            tree.watchers.retain(|w| w.session != self.id);
            let owned: Vec<String> = tree
                .nodes
                .iter()
                .filter(|(_, owner)| **owner == self.id)
                .map(|(path, _)| path.clone())
                .collect();
            for path in owned {
                tree.nodes.remove(&path);
                tree.notify(&path, RegistryEvent::ChildRemoved(path.clone()));
            }
        }
        info!(session = self.id, "registry session expired");
        let _ = self.states.send(BackendState::Disconnected);
    }

    /// Bring up a new session after [`expire`](Self::expire).
    pub fn restore(&self) {
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session = self.id, "registry session restored");
        let _ = self.states.send(BackendState::Reconnected);
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RegistryError::Disconnected)
        }
    }
}

#[async_trait]
impl RegistryBackend for MemorySession {
    fn namespace(&self) -> &str {
        &self.registry.namespace
    }

    async fn register(&self, meta: &RegisterMeta) -> Result<()> {
        self.ensure_connected()?;
        let path = meta.node_path(self.namespace());
        let mut tree = self.registry.tree.lock();
        match tree.nodes.get(&path) {
            Some(owner) if *owner == self.id => return Ok(()),
            Some(_) => return Err(RegistryError::NodeExists(path)),
            None => {}
        }
        tree.nodes.insert(path.clone(), self.id);
        tree.notify(&path, RegistryEvent::ChildAdded(path.clone()));
        debug!(session = self.id, path = %path, "node created");
        Ok(())
    }

    async fn unregister(&self, meta: &RegisterMeta) -> Result<()> {
        self.ensure_connected()?;
        let path = meta.node_path(self.namespace());
        let mut tree = self.registry.tree.lock();
        if tree.nodes.remove(&path).is_none() {
            return Err(RegistryError::NoNode(path));
        }
        tree.notify(&path, RegistryEvent::ChildRemoved(path.clone()));
        debug!(session = self.id, path = %path, "node deleted");
        Ok(())
    }

    async fn children(&self, service: &ServiceMeta) -> Result<Vec<String>> {
        self.ensure_connected()?;
        let parent = service.provider_path(self.namespace());
        Ok(self.registry.tree.lock().children(&parent))
    }

    async fn subscribe(&self, service: &ServiceMeta) -> Result<mpsc::UnboundedReceiver<RegistryEvent>> {
        self.ensure_connected()?;
        let parent = service.provider_path(self.namespace());
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut tree = self.registry.tree.lock();
        for path in tree.children(&parent) {
            let _ = sender.send(RegistryEvent::ChildAdded(path));
        }
        tree.watchers.push(Watcher {
            session: self.id,
            parent,
            sender,
        });
        Ok(receiver)
    }

    fn state_events(&self) -> broadcast::Receiver<BackendState> {
        self.states.subscribe()
    }
}
