//! # flexds-build
//!
//! Projection of the discovered service set into Envoy configuration.
//!
//! [`build_snapshot`] is a pure function from services to a versioned set of
//! clusters, load assignments, a route configuration, and listeners.
//! [`SnapshotManager`] wraps it with cache installation: every build lands
//! under the reference key and is fanned out to all known client keys.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod manager;
mod metrics;

pub use builder::build_snapshot;
pub use manager::SnapshotManager;
