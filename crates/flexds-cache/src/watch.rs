//! Watch subscriptions for cache update notifications.
//!
//! Each open xDS stream holds a [`Watch`] on its node key; every
//! [`SnapshotCache::set`](crate::SnapshotCache::set) for that key delivers
//! the new snapshot through the watch channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use flexds_core::{FlexdsError, FlexdsResult, NodeKey};

use crate::Snapshot;

/// Unique identifier for a watch subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

impl WatchId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for WatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

/// A subscription delivering snapshot updates for one node key.
#[derive(Debug)]
pub struct Watch {
    id: WatchId,
    key: NodeKey,
    receiver: mpsc::Receiver<Arc<Snapshot>>,
}

impl Watch {
    /// The subscription's unique identifier.
    #[inline]
    pub fn id(&self) -> WatchId {
        self.id
    }

    /// The node key this watch observes.
    #[inline]
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    /// Receive the next snapshot update. `None` once cancelled.
    pub async fn recv(&mut self) -> Option<Arc<Snapshot>> {
        self.receiver.recv().await
    }

    /// Non-blocking receive, for tests and draining.
    pub fn try_recv(&mut self) -> Result<Arc<Snapshot>, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

#[derive(Debug, Clone)]
struct WatchSender {
    id: WatchId,
    sender: mpsc::Sender<Arc<Snapshot>>,
}

impl WatchSender {
    /// Non-blocking send. A full channel drops this update; the receiver
    /// reads the current snapshot from the cache on its next wake, so only
    /// intermediate states are lost.
    fn try_send(&self, snapshot: Arc<Snapshot>) -> FlexdsResult<()> {
        match self.sender.try_send(snapshot) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(watch_id = %self.id, "watch channel full, skipping update");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(FlexdsError::WatchClosed { watch_id: self.id.0 })
            }
        }
    }
}

/// Tracks watch subscriptions per node key.
///
/// Uses a `Mutex` internally; every operation is short and lock-free of I/O.
#[derive(Debug)]
pub struct WatchManager {
    watches: Mutex<HashMap<NodeKey, Vec<WatchSender>>>,
    channel_buffer: usize,
}

impl Default for WatchManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchManager {
    /// Create a manager with the default channel buffer.
    pub fn new() -> Self {
        Self::with_buffer_size(16)
    }

    /// Create a manager with a custom per-watch channel buffer.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            watches: Mutex::new(HashMap::new()),
            channel_buffer: buffer_size,
        }
    }

    /// Subscribe to updates for a node key.
    pub fn create_watch(&self, key: NodeKey) -> Watch {
        let id = WatchId::next();
        let (sender, receiver) = mpsc::channel(self.channel_buffer);

        {
            let mut watches = self.watches.lock().expect("watch lock poisoned");
            watches
                .entry(key.clone())
                .or_default()
                .push(WatchSender { id, sender });
        }

        debug!(watch_id = %id, node = %key, "created watch");
        Watch { id, key, receiver }
    }

    /// Cancel a subscription.
    pub fn cancel_watch(&self, watch_id: WatchId) {
        let mut watches = self.watches.lock().expect("watch lock poisoned");
        for senders in watches.values_mut() {
            if let Some(pos) = senders.iter().position(|s| s.id == watch_id) {
                senders.swap_remove(pos);
                debug!(watch_id = %watch_id, "cancelled watch");
                return;
            }
        }
        warn!(watch_id = %watch_id, "attempted to cancel unknown watch");
    }

    /// Deliver a snapshot to every watch on a key, pruning closed ones.
    pub fn notify(&self, key: &NodeKey, snapshot: Arc<Snapshot>) {
        let senders: Vec<WatchSender> = {
            let watches = self.watches.lock().expect("watch lock poisoned");
            watches.get(key).cloned().unwrap_or_default()
        };
        if senders.is_empty() {
            return;
        }

        let mut closed = Vec::new();
        for sender in &senders {
            if let Err(FlexdsError::WatchClosed { watch_id }) =
                sender.try_send(Arc::clone(&snapshot))
            {
                closed.push(WatchId(watch_id));
            }
        }

        if !closed.is_empty() {
            let mut watches = self.watches.lock().expect("watch lock poisoned");
            if let Some(senders) = watches.get_mut(key) {
                senders.retain(|s| !closed.contains(&s.id));
            }
            debug!(count = closed.len(), "removed closed watches");
        }
    }

    /// Number of active watches for a key.
    pub fn watch_count(&self, key: &NodeKey) -> usize {
        let watches = self.watches.lock().expect("watch lock poisoned");
        watches.get(key).map_or(0, Vec::len)
    }
}
