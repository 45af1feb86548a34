//! Request/response correlation.
//!
//! Every outbound request registers an [`InvokeFuture`] in the runtime's
//! [`FutureRegistry`] before its frame is written. The future completes
//! exactly once, from whichever of these gets there first:
//! - the matching response read off the wire
//! - a write failure reported by the channel
//! - the timeout scanner
//!
//! Unicast futures are keyed by invoke id. Broadcast futures are keyed by
//! `(channel id, invoke id)` because every branch of a broadcast reuses the
//! same invoke id.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use saturn_common::{Address, ResponseFrame, Result, SaturnError, TimeoutKind};

/// Completion callback. Runs on the thread that completes the future.
pub type CompletionListener = Box<dyn FnOnce(Result<ResponseFrame>) + Send + 'static>;

#[derive(Default)]
struct Slot {
    done: bool,
    result: Option<Result<ResponseFrame>>,
    listener: Option<CompletionListener>,
    sent_at: Option<Instant>,
}

/// Pending result of one request on one channel.
///
/// PENDING → COMPLETED | TIMED_OUT. The first completion wins; later ones
/// are logged and dropped. A completed result goes either to the listener
/// or to a waiter, never both.
pub struct InvokeFuture {
    invoke_id: u64,
    channel_id: u64,
    address: Address,
    broadcast: bool,
    timeout: Duration,
    start: Instant,
    slot: Mutex<Slot>,
    condvar: Condvar,
    notify: Notify,
}

impl InvokeFuture {
    pub fn new(invoke_id: u64, channel_id: u64, address: Address, timeout: Duration) -> Self {
        Self {
            invoke_id,
            channel_id,
            address,
            broadcast: false,
            timeout,
            start: Instant::now(),
            slot: Mutex::new(Slot::default()),
            condvar: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// A branch of a broadcast call, correlated by `(channel_id, invoke_id)`.
    pub fn broadcast(invoke_id: u64, channel_id: u64, address: Address, timeout: Duration) -> Self {
        Self {
            broadcast: true,
            ..Self::new(invoke_id, channel_id, address, timeout)
        }
    }

    pub fn invoke_id(&self) -> u64 {
        self.invoke_id
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    /// Record that the request frame was flushed to the socket.
    pub fn mark_sent(&self) {
        let mut slot = self.slot.lock();
        if slot.sent_at.is_none() {
            slot.sent_at = Some(Instant::now());
        }
    }

    pub fn sent_at(&self) -> Option<Instant> {
        self.slot.lock().sent_at
    }

    pub fn is_done(&self) -> bool {
        self.slot.lock().done
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.start) >= self.timeout
    }

    /// Complete the future. Returns `false` if it had already completed.
    pub fn complete(&self, result: Result<ResponseFrame>) -> bool {
        let listener = {
            let mut slot = self.slot.lock();
            if slot.done {
                drop(slot);
                match &result {
                    Ok(_) => warn!(
                        invoke_id = self.invoke_id,
                        address = %self.address,
                        "late response discarded, future already completed"
                    ),
                    Err(e) => debug!(
                        invoke_id = self.invoke_id,
                        error = %e,
                        "completion ignored, future already completed"
                    ),
                }
                return false;
            }
            slot.done = true;
            match slot.listener.take() {
                Some(listener) => Some((listener, result)),
                None => {
                    slot.result = Some(result);
                    None
                }
            }
        };

        match listener {
            Some((listener, result)) => listener(result),
            None => {
                self.condvar.notify_all();
                self.notify.notify_waiters();
            }
        }
        true
    }

    /// Deliver the result to `listener` instead of a waiter.
    ///
    /// If the future already completed the listener runs immediately on the
    /// calling thread.
    pub fn set_listener(&self, listener: CompletionListener) {
        let ready = {
            let mut slot = self.slot.lock();
            match slot.result.take() {
                Some(result) => Some(result),
                None if slot.done => Some(Err(SaturnError::AlreadyConsumed(self.invoke_id))),
                None => {
                    slot.listener = Some(listener);
                    return;
                }
            }
        };
        if let Some(result) = ready {
            listener(result);
        }
    }

    /// Wait asynchronously for completion and take the result.
    pub async fn wait(&self) -> Result<ResponseFrame> {
        loop {
            let notified = self.notify.notified();
            if let Some(result) = self.try_take()? {
                return result;
            }
            notified.await;
        }
    }

    /// Block the calling thread until completion and take the result.
    ///
    /// Never call this from inside an async task.
    pub fn wait_blocking(&self) -> Result<ResponseFrame> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.result.take() {
                return result;
            }
            if slot.done {
                return Err(SaturnError::AlreadyConsumed(self.invoke_id));
            }
            self.condvar.wait(&mut slot);
        }
    }

    fn try_take(&self) -> Result<Option<Result<ResponseFrame>>> {
        let mut slot = self.slot.lock();
        match slot.result.take() {
            Some(result) => Ok(Some(result)),
            None if slot.done => Err(SaturnError::AlreadyConsumed(self.invoke_id)),
            None => Ok(None),
        }
    }

    fn timeout_error(&self) -> SaturnError {
        let kind = if self.sent_at().is_some() {
            TimeoutKind::Server
        } else {
            TimeoutKind::Client
        };
        SaturnError::Timeout {
            kind,
            invoke_id: self.invoke_id,
            timeout_ms: self.timeout.as_millis() as u64,
            address: Some(self.address.clone()),
        }
    }
}

/// Correlation map shared by channels (completion) and the scanner (timeout).
#[derive(Default)]
pub struct FutureRegistry {
    unicast: DashMap<u64, Arc<InvokeFuture>>,
    broadcast: DashMap<(u64, u64), Arc<InvokeFuture>>,
}

impl FutureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `future` before its frame is written.
    ///
    /// A unicast registration replaces any earlier one with the same invoke
    /// id. Fail-over relies on this: every attempt reuses the invoke id, so
    /// a stale response from an earlier attempt completes the current one.
    pub fn register(&self, future: Arc<InvokeFuture>) {
        if future.is_broadcast() {
            self.broadcast
                .insert((future.channel_id(), future.invoke_id()), future);
        } else if let Some(previous) = self.unicast.insert(future.invoke_id(), future) {
            debug!(
                invoke_id = previous.invoke_id(),
                "superseded pending registration"
            );
        }
    }

    /// Route a response read on `channel_id`. Returns `false` if nothing was
    /// waiting for it.
    pub fn received(&self, channel_id: u64, response: ResponseFrame) -> bool {
        let invoke_id = response.invoke_id;
        let future = self
            .unicast
            .remove(&invoke_id)
            .map(|(_, future)| future)
            .or_else(|| {
                self.broadcast
                    .remove(&(channel_id, invoke_id))
                    .map(|(_, future)| future)
            });

        match future {
            Some(future) => future.complete(Ok(response)),
            None => {
                warn!(invoke_id, channel_id, "response for unknown invoke id discarded");
                false
            }
        }
    }

    /// Complete `future` with `error` if it is still the registered one.
    pub fn fail(&self, future: &Arc<InvokeFuture>, error: SaturnError) -> bool {
        self.deregister(future);
        future.complete(Err(error))
    }

    /// Drop the registration of `future` without completing it.
    pub fn deregister(&self, future: &Arc<InvokeFuture>) {
        if future.is_broadcast() {
            self.broadcast
                .remove_if(&(future.channel_id(), future.invoke_id()), |_, f| {
                    Arc::ptr_eq(f, future)
                });
        } else {
            self.unicast
                .remove_if(&future.invoke_id(), |_, f| Arc::ptr_eq(f, future));
        }
    }

    /// Time out every expired future. Returns how many were completed.
    pub fn scan_timeouts(&self) -> usize {
        let now = Instant::now();
        let mut expired: Vec<Arc<InvokeFuture>> = self
            .unicast
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.value().clone())
            .collect();
        expired.extend(
            self.broadcast
                .iter()
                .filter(|entry| entry.value().is_expired(now))
                .map(|entry| entry.value().clone()),
        );

        let mut completed = 0;
        for future in expired {
            self.deregister(&future);
            let error = future.timeout_error();
            trace!(invoke_id = future.invoke_id(), error = %error, "invoke timed out");
            if future.complete(Err(error)) {
                completed += 1;
            }
        }
        completed
    }

    pub fn pending(&self) -> usize {
        self.unicast.len() + self.broadcast.len()
    }

    /// Spawn the periodic timeout scanner.
    pub fn spawn_scanner(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let timed_out = registry.scan_timeouts();
                if timed_out > 0 {
                    debug!(timed_out, pending = registry.pending(), "timeout scan");
                }
            }
        })
    }
}
