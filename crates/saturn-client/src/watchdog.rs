//! Automatic reconnection for one provider connection.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use saturn_common::Address;

use crate::channel::ChannelFactory;
use crate::group::ChannelGroup;

/// Keeps one connection to `address` alive inside its [`ChannelGroup`].
///
/// Each time the connection drops (or a connect attempt fails) the watchdog
/// sleeps `base_delay * 2^attempts`, the exponent capped at `max_attempts`,
/// then reconnects. A successful connect resets the exponent and re-adds the
/// new channel to the group.
pub struct ConnectionWatchdog {
    address: Address,
    group: Arc<ChannelGroup>,
    factory: Arc<dyn ChannelFactory>,
    base_delay: Duration,
    max_attempts: u32,
    attempts: AtomicU32,
    disabled: AtomicBool,
    shutdown: Notify,
}

impl ConnectionWatchdog {
    /// Creates a new watchdog.
    ///
    /// # Arguments
    /// * `group` - The group the connection belongs to
    /// * `factory` - Opens the underlying channel
    /// * `base_delay` - Backoff unit
    /// * `max_attempts` - Ceiling on the backoff exponent
    pub fn new(
        group: Arc<ChannelGroup>,
        factory: Arc<dyn ChannelFactory>,
        base_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            address: group.address().clone(),
            group,
            factory,
            base_delay,
            max_attempts,
            attempts: AtomicU32::new(0),
            disabled: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Stop reconnecting and close the watched channel, permanently.
    pub fn disable(&self) {
        if !self.disabled.swap(true, Ordering::SeqCst) {
            info!(address = %self.address, "reconnection disabled");
        }
        self.shutdown.notify_one();
    }

    /// Backoff before the next attempt, given the attempts made so far.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(self.max_attempts).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Starts the watchdog task.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        loop {
            if self.is_disabled() {
                break;
            }

            match self.factory.connect(&self.address).await {
                Ok(channel) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    if self.is_disabled() {
                        channel.close();
                        break;
                    }
                    self.group.add(channel.clone());
                    info!(address = %self.address, channel_id = channel.id(), "connected");

                    tokio::select! {
                        _ = channel.closed() => {
                            self.group.remove(channel.id());
                            warn!(address = %self.address, channel_id = channel.id(), "connection lost");
                        }
                        _ = self.shutdown.notified() => {
                            channel.close();
                            self.group.remove(channel.id());
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!(address = %self.address, error = %e, "connect failed");
                }
            }

            if self.is_disabled() {
                break;
            }

            let attempts = self.attempts.load(Ordering::SeqCst);
            let delay = self.delay(attempts);
            if attempts < self.max_attempts {
                self.attempts.store(attempts + 1, Ordering::SeqCst);
            }
            debug!(address = %self.address, attempts, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => break,
            }
        }
        debug!(address = %self.address, "watchdog stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::MockChannel;
    use crate::channel::Channel;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use saturn_common::{Result, SaturnError};
    use std::sync::atomic::AtomicUsize;

    /// Fails the first `failures` connects, then hands out mock channels.
    struct FlakyFactory {
        failures: usize,
        calls: AtomicUsize,
        opened: Mutex<Vec<Arc<MockChannel>>>,
    }

    impl FlakyFactory {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicUsize::new(0),
                opened: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChannelFactory for FlakyFactory {
        async fn connect(&self, address: &Address) -> Result<Arc<dyn Channel>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(SaturnError::ConnectFailed(address.to_string()));
            }
            let channel = MockChannel::new(address.clone());
            self.opened.lock().push(channel.clone());
            Ok(channel as Arc<dyn Channel>)
        }
    }

    fn group() -> Arc<ChannelGroup> {
        Arc::new(ChannelGroup::new(
            Address::new("127.0.0.1", 18091),
            Duration::ZERO,
            Duration::from_secs(300),
        ))
    }

    #[test]
    fn test_delay_doubles_up_to_ceiling() {
        let watchdog = ConnectionWatchdog::new(
            group(),
            FlakyFactory::new(0),
            Duration::from_millis(2),
            12,
        );
        assert_eq!(watchdog.delay(0), Duration::from_millis(2));
        assert_eq!(watchdog.delay(1), Duration::from_millis(4));
        assert_eq!(watchdog.delay(5), Duration::from_millis(64));
        assert_eq!(watchdog.delay(12), Duration::from_millis(8192));
        assert_eq!(watchdog.delay(40), Duration::from_millis(8192));
    }

    #[tokio::test]
    async fn test_connects_after_failures_and_resets_attempts() {
        let group = group();
        let factory = FlakyFactory::new(3);
        let watchdog = Arc::new(ConnectionWatchdog::new(
            group.clone(),
            factory.clone(),
            Duration::from_millis(1),
            12,
        ));
        let handle = watchdog.clone().spawn();

        assert!(group.wait_for_available(Duration::from_secs(2)).await);
        assert_eq!(factory.calls.load(Ordering::SeqCst), 4);
        assert_eq!(watchdog.attempts(), 0);

        watchdog.disable();
        handle.await.unwrap();
        assert!(!group.is_available());
    }

    #[tokio::test]
    async fn test_reconnects_after_close() {
        let group = group();
        let factory = FlakyFactory::new(0);
        let watchdog = Arc::new(ConnectionWatchdog::new(
            group.clone(),
            factory.clone(),
            Duration::from_millis(1),
            12,
        ));
        let handle = watchdog.clone().spawn();
        assert!(group.wait_for_available(Duration::from_secs(2)).await);

        let first = factory.opened.lock()[0].clone();
        first.close();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while factory.opened.lock().len() < 2 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(group.wait_for_available(Duration::from_secs(2)).await);
        assert_eq!(group.size(), 1);
        assert_ne!(group.channels()[0].id(), first.id());

        watchdog.disable();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_disable_stops_retrying() {
        let factory = FlakyFactory::new(usize::MAX);
        let watchdog = Arc::new(ConnectionWatchdog::new(
            group(),
            factory.clone(),
            Duration::from_millis(50),
            12,
        ));
        let handle = watchdog.clone().spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        watchdog.disable();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        let calls = factory.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(factory.calls.load(Ordering::SeqCst), calls);
    }
}
