//! Coordination backend seam.
//!
//! The backend durably stores provider registrations as ephemeral nodes
//! under `/<namespace>/provider/<group>/<name>/<version>/` and notifies
//! subscribers as children come and go. Consensus and durability are the
//! backend's business; this crate only consumes the contract below.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use saturn_common::{RegisterMeta, ServiceMeta};

use crate::error::Result;

/// Change to the children of a subscribed service path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// Full node path of a new registration.
    ChildAdded(String),
    /// Full node path of a removed registration.
    ChildRemoved(String),
}

/// Connection state of the backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Connected,
    /// The session is gone: its ephemeral nodes and watches are lost.
    Disconnected,
    /// A new session is up; registrations and watches must be recreated.
    Reconnected,
}

#[async_trait]
pub trait RegistryBackend: Send + Sync {
    fn namespace(&self) -> &str;

    /// Create the ephemeral node for `meta`.
    async fn register(&self, meta: &RegisterMeta) -> Result<()>;

    async fn unregister(&self, meta: &RegisterMeta) -> Result<()>;

    /// Node paths currently registered for `service`.
    async fn children(&self, service: &ServiceMeta) -> Result<Vec<String>>;

    /// Watch the children of `service`.
    ///
    /// The receiver first yields a `ChildAdded` for every current child,
    /// then live changes. It ends when the session is lost.
    async fn subscribe(&self, service: &ServiceMeta) -> Result<mpsc::UnboundedReceiver<RegistryEvent>>;

    fn state_events(&self) -> broadcast::Receiver<BackendState>;
}
