//! Connection abstraction.
//!
//! A [`Channel`] is one live connection to a provider. Writes are queued and
//! report their flush outcome through a [`WriteListener`]; responses are
//! routed by the channel itself into the runtime's future registry.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use saturn_common::{Address, Message, Result};

/// Receives the outcome of flushing one frame to the socket.
pub type WriteListener = Box<dyn FnOnce(Result<()>) + Send + 'static>;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique channel id, used in broadcast correlation keys.
pub fn next_channel_id() -> u64 {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> u64;

    fn remote_address(&self) -> &Address;

    fn is_active(&self) -> bool;

    /// Queue `message` for writing. `listener` is always called exactly once.
    fn write(&self, message: Message, listener: WriteListener);

    /// Close the connection. Idempotent.
    fn close(&self);

    /// Resolves once the channel is closed, by either side.
    async fn closed(&self);
}

impl fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("remote_address", self.remote_address())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Resolves once `closed` holds `true` or its sender is gone.
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Opens channels to a provider address.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn connect(&self, address: &Address) -> Result<Arc<dyn Channel>>;
}
