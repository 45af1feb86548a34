//! Service directory → channel groups.
//!
//! Each directory owns a copy-on-write list of the groups serving it. All
//! lists share one reference-count map so that a group serving several
//! directories is only reclaimed once none of them references it.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;

use saturn_common::Address;

use crate::group::ChannelGroup;

type RefCounts = Arc<DashMap<Address, usize>>;

/// Copy-on-write set of groups for one directory.
///
/// Reads never block. Writers serialize on a per-list lock and swap in a
/// fresh vector.
pub struct CopyOnWriteGroupList {
    groups: ArcSwap<Vec<Arc<ChannelGroup>>>,
    write_lock: Mutex<()>,
    ref_counts: RefCounts,
}

impl CopyOnWriteGroupList {
    fn new(ref_counts: RefCounts) -> Self {
        Self {
            groups: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            ref_counts,
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<ChannelGroup>>> {
        self.groups.load_full()
    }

    pub fn len(&self) -> usize {
        self.groups.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.load().is_empty()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.groups.load().iter().any(|g| g.address() == address)
    }

    /// Add `group` unless a group for the same address is present.
    pub fn add_if_absent(&self, group: Arc<ChannelGroup>) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.groups.load();
        if current.iter().any(|g| g.address() == group.address()) {
            return false;
        }
        let address = group.address().clone();
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(group);
        self.groups.store(Arc::new(next));

        *self.ref_counts.entry(address).or_insert(0) += 1;
        true
    }

    /// Remove the group for `address`. Returns `false` if absent.
    pub fn remove(&self, address: &Address) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.groups.load();
        if !current.iter().any(|g| g.address() == address) {
            return false;
        }
        let next: Vec<Arc<ChannelGroup>> = current
            .iter()
            .filter(|g| g.address() != address)
            .cloned()
            .collect();
        self.groups.store(Arc::new(next));

        self.ref_counts.remove_if_mut(address, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
        true
    }
}

/// Directory string → group list, created on first lookup.
#[derive(Default)]
pub struct DirectoryGroupTable {
    lists: DashMap<String, Arc<CopyOnWriteGroupList>>,
    ref_counts: RefCounts,
}

impl DirectoryGroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The group list for `directory`, created atomically if absent.
    pub fn find(&self, directory: &str) -> Arc<CopyOnWriteGroupList> {
        if let Some(list) = self.lists.get(directory) {
            return list.clone();
        }
        self.lists
            .entry(directory.to_string())
            .or_insert_with(|| Arc::new(CopyOnWriteGroupList::new(self.ref_counts.clone())))
            .clone()
    }

    /// Number of directories currently referencing the group for `address`.
    pub fn ref_count(&self, address: &Address) -> usize {
        self.ref_counts.get(address).map(|c| *c).unwrap_or(0)
    }

    pub fn directories(&self) -> Vec<String> {
        self.lists.iter().map(|e| e.key().clone()).collect()
    }
}
