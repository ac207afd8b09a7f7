//! Cache keys for per-client snapshots.
//!
//! The snapshot cache is keyed by the Envoy node ID, plus one sentinel key
//! holding the reference snapshot that new clients are primed from.

use std::fmt;
use std::sync::Arc;

/// Sentinel key the snapshot manager installs every build under before
/// fanning out to client keys.
const REFERENCE_KEY: &str = "__REFERENCE_SNAPSHOT__";

/// A snapshot cache key: either a client node ID or the reference sentinel.
///
/// Cheap to clone; keys are shared immutable strings.
///
/// # Example
///
/// ```rust
/// use flexds_core::NodeKey;
///
/// let envoy = NodeKey::new("envoy-front-1");
/// assert!(!envoy.is_reference());
/// assert!(NodeKey::reference().is_reference());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeKey(Arc<str>);

impl NodeKey {
    /// Key for a client node ID.
    pub fn new(node_id: &str) -> Self {
        Self(Arc::from(node_id))
    }

    /// The reference-snapshot sentinel key.
    pub fn reference() -> Self {
        Self(Arc::from(REFERENCE_KEY))
    }

    /// Whether this is the reference sentinel.
    #[inline]
    pub fn is_reference(&self) -> bool {
        &*self.0 == REFERENCE_KEY
    }

    /// The key as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_key_equality() {
        assert_eq!(NodeKey::new("a"), NodeKey::new("a"));
        assert_ne!(NodeKey::new("a"), NodeKey::new("b"));
    }

    #[test]
    fn reference_sentinel() {
        let reference = NodeKey::reference();
        assert!(reference.is_reference());
        assert_eq!(reference, NodeKey::new(REFERENCE_KEY));
        assert!(!NodeKey::new("envoy-1").is_reference());
    }

    #[test]
    fn display_is_raw_id() {
        assert_eq!(NodeKey::new("envoy-1").to_string(), "envoy-1");
    }
}
