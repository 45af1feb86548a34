//! Live provider membership for the Saturn consumer runtime.
//!
//! Providers publish [`RegisterMeta`](saturn_common::RegisterMeta) nodes
//! through a [`RegistryBackend`]; consumers subscribe per service and a
//! [`RegistrySubscriber`] keeps the runtime's directory in step with the
//! nodes it sees. [`RegistryClient`] ties both together and replays its
//! state whenever the backend comes back with a new session.

pub mod backend;
pub mod client;
pub mod error;
pub mod memory;
pub mod subscriber;

pub use backend::{BackendState, RegistryBackend, RegistryEvent};
pub use client::RegistryClient;
pub use error::{RegistryError, Result};
pub use memory::{MemoryRegistry, MemorySession};
pub use subscriber::{OfflineListener, OfflineNotifier, RegistrySubscriber};
