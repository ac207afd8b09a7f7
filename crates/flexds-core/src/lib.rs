//! # flexds-core
//!
//! Core types shared by every FlexDS crate:
//!
//! - The canonical service model produced by discovery sources
//!   ([`DiscoveredService`], [`ServiceInstance`], [`RoutePattern`])
//! - [`FlexdsError`], the workspace-wide error type
//! - [`NodeKey`], cache keys for per-client snapshots
//! - [`ResourceKind`], the four xDS resource types FlexDS serves
//! - The process-global snapshot version counter

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod model;
mod node;
mod resource;
mod version;

pub use error::{FlexdsError, FlexdsResult};
pub use model::{DiscoveredService, MatchType, Rewrite, RoutePattern, ServiceInstance};
pub use node::NodeKey;
pub use resource::ResourceKind;
pub use version::next_version;
