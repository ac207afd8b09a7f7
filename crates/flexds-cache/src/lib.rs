//! # flexds-cache
//!
//! Keyed store of versioned xDS resource snapshots.
//!
//! The cache holds one [`Snapshot`] per key: the reference sentinel written
//! by the snapshot manager, plus one key per connected client node. Writes
//! wake any stream watching the written key; streams then decide what to
//! deliver by comparing versions against the client's last acknowledgement.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod snapshot;
mod watch;

pub use cache::SnapshotCache;
pub use snapshot::{ResourceEntry, ResourceSet, Snapshot, SnapshotBuilder};
pub use watch::{Watch, WatchId, WatchManager};
