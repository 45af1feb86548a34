//! Connection pool for one provider address.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info};

use saturn_common::{Address, Result, SaturnError, DEFAULT_WEIGHT, MAX_WEIGHT};

use crate::channel::Channel;

/// Bounded wait used by [`ChannelGroup::next`] when the group is empty.
const NEXT_WAIT: Duration = Duration::from_millis(1000);

struct Times {
    /// Reset whenever a channel is added; drives warm-up.
    timestamp: Instant,
    /// Set when the group becomes empty, cleared on add.
    deadline: Option<Instant>,
}

/// Live channels to one [`Address`].
///
/// Readers take a lock-free snapshot of the channel list; writers copy the
/// list and swap it under a short lock. The group also carries per-directory
/// weights and the warm-up / loss bookkeeping used by load balancing and
/// reclamation.
pub struct ChannelGroup {
    address: Address,
    channels: ArcSwap<Vec<Arc<dyn Channel>>>,
    write_lock: Mutex<()>,
    index: AtomicUsize,
    weights: RwLock<HashMap<String, u32>>,
    warm_up: Duration,
    loss_interval: Duration,
    times: Mutex<Times>,
    signal: Mutex<()>,
    condvar: Condvar,
    notify: Notify,
}

impl ChannelGroup {
    pub fn new(address: Address, warm_up: Duration, loss_interval: Duration) -> Self {
        Self {
            address,
            channels: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            index: AtomicUsize::new(0),
            weights: RwLock::new(HashMap::new()),
            warm_up,
            loss_interval,
            times: Mutex::new(Times {
                timestamp: Instant::now(),
                deadline: None,
            }),
            signal: Mutex::new(()),
            condvar: Condvar::new(),
            notify: Notify::new(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Add a channel. Returns `false` if it was already a member.
    pub fn add(&self, channel: Arc<dyn Channel>) -> bool {
        {
            let _guard = self.write_lock.lock();
            let current = self.channels.load();
            if current.iter().any(|c| c.id() == channel.id()) {
                return false;
            }
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(channel);
            self.channels.store(Arc::new(next));

            let mut times = self.times.lock();
            times.timestamp = Instant::now();
            times.deadline = None;
        }

        debug!(address = %self.address, size = self.size(), "channel added");

        let _signal = self.signal.lock();
        self.condvar.notify_all();
        self.notify.notify_waiters();
        true
    }

    /// Remove a channel by id. Returns `false` if it was not a member.
    pub fn remove(&self, channel_id: u64) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.channels.load();
        if !current.iter().any(|c| c.id() == channel_id) {
            return false;
        }
        let next: Vec<Arc<dyn Channel>> = current
            .iter()
            .filter(|c| c.id() != channel_id)
            .cloned()
            .collect();
        let now_empty = next.is_empty();
        self.channels.store(Arc::new(next));

        if now_empty {
            self.times.lock().deadline = Some(Instant::now() + self.loss_interval);
            info!(address = %self.address, "channel group lost its last channel");
        }
        true
    }

    /// Next channel in rotation.
    ///
    /// If the group is empty waits up to one second, or `budget` if that is
    /// shorter, for a channel to be added before giving up.
    pub async fn next(&self, budget: Duration) -> Result<Arc<dyn Channel>> {
        if let Some(channel) = self.pick() {
            return Ok(channel);
        }
        self.wait_for_available(budget.min(NEXT_WAIT)).await;
        self.pick().ok_or_else(|| {
            SaturnError::ChannelClosed(format!("no active channel to {}", self.address))
        })
    }

    fn pick(&self) -> Option<Arc<dyn Channel>> {
        let snapshot = self.channels.load();
        if snapshot.is_empty() {
            return None;
        }
        let index = self.index.fetch_add(1, Ordering::Relaxed);
        Some(snapshot[index % snapshot.len()].clone())
    }

    pub fn channels(&self) -> Arc<Vec<Arc<dyn Channel>>> {
        self.channels.load_full()
    }

    pub fn size(&self) -> usize {
        self.channels.load().len()
    }

    pub fn is_available(&self) -> bool {
        !self.channels.load().is_empty()
    }

    /// Wait until at least one channel exists or `timeout` elapses.
    pub async fn wait_for_available(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.is_available() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Blocking variant of [`wait_for_available`](Self::wait_for_available)
    /// for synchronous call sites.
    pub fn wait_for_available_blocking(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signal = self.signal.lock();
        while !self.is_available() {
            if self.condvar.wait_until(&mut signal, deadline).timed_out() {
                return self.is_available();
            }
        }
        true
    }

    pub fn is_warm_up_complete(&self) -> bool {
        self.times.lock().timestamp.elapsed() >= self.warm_up
    }

    /// Configured weight of this group for `directory`.
    pub fn weight(&self, directory: &str) -> u32 {
        self.weights
            .read()
            .get(directory)
            .copied()
            .unwrap_or(DEFAULT_WEIGHT)
    }

    /// Weight scaled down while warming up, never below 1.
    pub fn effective_weight(&self, directory: &str) -> u32 {
        let weight = self.weight(directory);
        let uptime = self.times.lock().timestamp.elapsed();
        if uptime >= self.warm_up || self.warm_up.is_zero() {
            return weight.max(1);
        }
        let scaled = (weight as u128 * uptime.as_millis()) / self.warm_up.as_millis();
        (scaled as u32).max(1)
    }

    /// Set the weight for `directory`, capped at [`MAX_WEIGHT`].
    pub fn put_weight(&self, directory: &str, weight: u32) {
        let weight = weight.min(MAX_WEIGHT);
        let mut weights = self.weights.write();
        if weight == DEFAULT_WEIGHT {
            weights.remove(directory);
        } else {
            weights.insert(directory.to_string(), weight);
        }
    }

    pub fn remove_weight(&self, directory: &str) {
        self.weights.write().remove(directory);
    }

    /// When the group became empty plus the loss interval, if it is empty.
    pub fn loss_deadline(&self) -> Option<Instant> {
        self.times.lock().deadline
    }

    pub fn is_lost(&self, now: Instant) -> bool {
        matches!(self.loss_deadline(), Some(deadline) if now >= deadline)
    }

    /// Close every channel and empty the group.
    pub fn close_all(&self) {
        let channels = self.channels();
        for channel in channels.iter() {
            channel.close();
            self.remove(channel.id());
        }
    }
}

impl fmt::Debug for ChannelGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelGroup")
            .field("address", &self.address)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::MockChannel;

    fn group() -> ChannelGroup {
        ChannelGroup::new(
            Address::new("127.0.0.1", 18090),
            Duration::ZERO,
            Duration::from_secs(300),
        )
    }

    fn channel() -> Arc<dyn Channel> {
        MockChannel::new(Address::new("127.0.0.1", 18090))
    }

    #[test]
    fn test_add_remove_membership() {
        let group = group();
        let a = channel();
        let b = channel();

        assert!(!group.is_available());
        assert!(group.add(a.clone()));
        assert!(!group.add(a.clone()));
        assert!(group.add(b.clone()));
        assert_eq!(group.size(), 2);

        assert!(group.remove(a.id()));
        assert!(!group.remove(a.id()));
        assert!(group.is_available());
        assert!(group.remove(b.id()));
        assert!(!group.is_available());
    }

    #[test]
    fn test_availability_tracks_any_sequence() {
        let group = group();
        let channels: Vec<_> = (0..4).map(|_| channel()).collect();
        let ops = [(0, true), (1, true), (0, false), (2, true), (1, false), (2, false), (3, true), (3, false)];

        let mut live = std::collections::HashSet::new();
        for (idx, add) in ops {
            let c = &channels[idx];
            if add {
                group.add(c.clone());
                live.insert(c.id());
            } else {
                group.remove(c.id());
                live.remove(&c.id());
            }
            assert_eq!(group.is_available(), !live.is_empty());
        }
    }

    #[test]
    fn test_loss_deadline_set_on_empty_and_cleared_on_add() {
        let group = group();
        let a = channel();
        group.add(a.clone());
        assert!(group.loss_deadline().is_none());

        group.remove(a.id());
        let deadline = group.loss_deadline().unwrap();
        assert!(deadline > Instant::now());
        assert!(!group.is_lost(Instant::now()));
        assert!(group.is_lost(deadline));

        group.add(channel());
        assert!(group.loss_deadline().is_none());
    }

    #[tokio::test]
    async fn test_next_rotates() {
        let group = group();
        let a = channel();
        let b = channel();
        group.add(a.clone());
        group.add(b.clone());

        let first = group.next(Duration::from_secs(1)).await.unwrap().id();
        let second = group.next(Duration::from_secs(1)).await.unwrap().id();
        let third = group.next(Duration::from_secs(1)).await.unwrap().id();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn test_next_on_empty_group_respects_budget() {
        let group = group();
        let start = Instant::now();
        let result = group.next(Duration::from_millis(30)).await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(SaturnError::ChannelClosed(_))));
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_millis(500), "waited {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_wait_for_available_wakes_on_add() {
        let group = Arc::new(group());
        let adder = group.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            adder.add(channel());
        });

        let start = Instant::now();
        assert!(group.wait_for_available(Duration::from_secs(5)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_for_available_times_out() {
        let group = group();
        assert!(!group.wait_for_available(Duration::from_millis(20)).await);
    }

    #[test]
    fn test_wait_for_available_blocking() {
        let group = Arc::new(group());
        let adder = group.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            adder.add(channel());
        });

        assert!(group.wait_for_available_blocking(Duration::from_secs(5)));
        handle.join().unwrap();
        assert!(!ChannelGroup::new(Address::new("h", 1), Duration::ZERO, Duration::ZERO)
            .wait_for_available_blocking(Duration::from_millis(10)));
    }

    #[test]
    fn test_weights_capped_and_default_omitted() {
        let group = group();
        group.put_weight("dir", 500);
        assert_eq!(group.weight("dir"), MAX_WEIGHT);

        group.put_weight("dir", DEFAULT_WEIGHT);
        assert!(group.weights.read().is_empty());
        assert_eq!(group.weight("dir"), DEFAULT_WEIGHT);
        assert_eq!(group.weight("other"), DEFAULT_WEIGHT);
    }

    #[test]
    fn test_warm_up_scales_weight() {
        let group = ChannelGroup::new(
            Address::new("127.0.0.1", 1),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        );
        group.put_weight("dir", 100);
        group.add(channel());
        assert!(!group.is_warm_up_complete());
        assert_eq!(group.effective_weight("dir"), 1);

        let warm = ChannelGroup::new(Address::new("127.0.0.1", 2), Duration::ZERO, Duration::ZERO);
        warm.put_weight("dir", 100);
        assert!(warm.is_warm_up_complete());
        assert_eq!(warm.effective_weight("dir"), 100);
    }
}
