//! Address → channel group, with watched connections.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use saturn_common::Address;

use crate::channel::ChannelFactory;
use crate::config::RuntimeConfig;
use crate::directory::{CopyOnWriteGroupList, DirectoryGroupTable};
use crate::group::ChannelGroup;
use crate::watchdog::ConnectionWatchdog;

/// Owns one [`ChannelGroup`] per provider address and the watchdogs that
/// keep its connections alive.
pub struct Connector {
    groups: DashMap<Address, Arc<ChannelGroup>>,
    watchdogs: DashMap<Address, Vec<Arc<ConnectionWatchdog>>>,
    factory: Arc<dyn ChannelFactory>,
    table: Arc<DirectoryGroupTable>,
    config: RuntimeConfig,
    /// Serializes directory membership changes against reference-count
    /// driven disconnects.
    membership: Mutex<()>,
}

impl Connector {
    pub fn new(
        factory: Arc<dyn ChannelFactory>,
        table: Arc<DirectoryGroupTable>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            groups: DashMap::new(),
            watchdogs: DashMap::new(),
            factory,
            table,
            config,
            membership: Mutex::new(()),
        }
    }

    /// The group for `address`, created empty if absent.
    pub fn group(&self, address: &Address) -> Arc<ChannelGroup> {
        if let Some(group) = self.groups.get(address) {
            return group.clone();
        }
        self.groups
            .entry(address.clone())
            .or_insert_with(|| {
                Arc::new(ChannelGroup::new(
                    address.clone(),
                    self.config.warm_up(),
                    self.config.loss_interval(),
                ))
            })
            .clone()
    }

    pub fn get(&self, address: &Address) -> Option<Arc<ChannelGroup>> {
        self.groups.get(address).map(|g| g.clone())
    }

    /// Ensure at least `count` watched connections to `address`.
    ///
    /// Returns immediately; connections are opened in the background.
    pub fn connect(&self, address: &Address, count: u32) -> Arc<ChannelGroup> {
        let group = self.group(address);
        let mut watchdogs = self.watchdogs.entry(address.clone()).or_default();
        watchdogs.retain(|w| !w.is_disabled());

        let missing = (count as usize).saturating_sub(watchdogs.len());
        for _ in 0..missing {
            let watchdog = Arc::new(ConnectionWatchdog::new(
                group.clone(),
                self.factory.clone(),
                Duration::from_millis(self.config.reconnect_base_delay_ms),
                self.config.reconnect_max_attempts,
            ));
            watchdog.clone().spawn();
            watchdogs.push(watchdog);
        }
        if missing > 0 {
            debug!(address = %address, count, "connecting");
        }
        group
    }

    /// Stop reconnecting to `address`, close its channels and forget the
    /// group. Returns `false` if the address was unknown.
    pub fn disconnect(&self, address: &Address) -> bool {
        if let Some((_, watchdogs)) = self.watchdogs.remove(address) {
            for watchdog in watchdogs {
                watchdog.disable();
            }
        }
        match self.groups.remove(address) {
            Some((_, group)) => {
                group.close_all();
                info!(address = %address, "disconnected");
                true
            }
            None => false,
        }
    }

    /// Connect to `address` and add its group to `list` with `weight` for
    /// `directory`.
    pub fn attach(
        &self,
        list: &CopyOnWriteGroupList,
        directory: &str,
        address: &Address,
        count: u32,
        weight: u32,
    ) -> Arc<ChannelGroup> {
        let _membership = self.membership.lock();
        let group = self.connect(address, count);
        group.put_weight(directory, weight);
        list.add_if_absent(group.clone());
        group
    }

    /// Remove `address` from `list` and disconnect it if no directory
    /// references it any more. Returns `true` if it was disconnected.
    pub fn detach(&self, list: &CopyOnWriteGroupList, directory: &str, address: &Address) -> bool {
        let _membership = self.membership.lock();
        list.remove(address);
        if let Some(group) = self.get(address) {
            group.remove_weight(directory);
        }
        if self.table.ref_count(address) > 0 {
            return false;
        }
        self.disconnect(address)
    }

    /// Disconnect groups that have been empty past their loss deadline and
    /// are no longer referenced by any directory.
    pub fn reclaim_lost_groups(&self) -> usize {
        let _membership = self.membership.lock();
        let now = Instant::now();
        let lost: Vec<Address> = self
            .groups
            .iter()
            .filter(|e| e.value().is_lost(now) && self.table.ref_count(e.key()) == 0)
            .map(|e| e.key().clone())
            .collect();

        let mut reclaimed = 0;
        for address in lost {
            if self.disconnect(&address) {
                reclaimed += 1;
            }
        }
        reclaimed
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.groups.iter().map(|e| e.key().clone()).collect()
    }

    /// Disable every watchdog and close every channel.
    pub fn shutdown(&self) {
        for address in self.addresses() {
            self.disconnect(&address);
        }
    }
}
