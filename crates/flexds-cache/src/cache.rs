//! The keyed snapshot store.
//!
//! `DashMap` gives lock-free concurrent reads; map references are always
//! dropped before any notification so no shard lock is held while waking
//! streams.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use flexds_core::NodeKey;

use crate::snapshot::Snapshot;
use crate::watch::{Watch, WatchId, WatchManager};

/// Concurrent snapshot store keyed by [`NodeKey`].
///
/// Holds the reference snapshot plus one entry per client node that has ever
/// connected. All operations are safe under concurrent access.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    snapshots: DashMap<NodeKey, Arc<Snapshot>>,
    watches: WatchManager,
}

impl SnapshotCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the snapshot for a key.
    pub fn get(&self, key: &NodeKey) -> Option<Arc<Snapshot>> {
        let result = self.snapshots.get(key).map(|entry| Arc::clone(&entry));
        trace!(node = %key, hit = result.is_some(), "cache lookup");
        result
    }

    /// Atomically replace the snapshot for a key and wake its watchers.
    pub fn set(&self, key: NodeKey, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        self.snapshots.insert(key.clone(), Arc::clone(&snapshot));

        debug!(
            node = %key,
            version = %snapshot.version(),
            resources = snapshot.total_resources(),
            "set snapshot"
        );

        // DashMap reference released above; notify without shard locks held.
        self.watches.notify(&key, snapshot);
    }

    /// All currently inhabited keys, reference sentinel included.
    pub fn keys(&self) -> Vec<NodeKey> {
        self.snapshots.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Whether a key holds a snapshot.
    pub fn contains(&self, key: &NodeKey) -> bool {
        self.snapshots.contains_key(key)
    }

    /// Number of cached snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Subscribe to snapshot updates for a key.
    #[inline]
    pub fn create_watch(&self, key: NodeKey) -> Watch {
        self.watches.create_watch(key)
    }

    /// Cancel a watch subscription.
    #[inline]
    pub fn cancel_watch(&self, watch_id: WatchId) {
        self.watches.cancel_watch(watch_id)
    }

    /// Number of active watches for a key. Test and introspection hook.
    #[inline]
    pub fn watch_count(&self, key: &NodeKey) -> usize {
        self.watches.watch_count(key)
    }
}
