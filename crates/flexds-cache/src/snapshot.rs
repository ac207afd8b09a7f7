//! Snapshot: immutable, versioned collection of built xDS resources.
//!
//! A snapshot is a consistent view of all four resource types at one
//! version. Snapshots are:
//!
//! - **Immutable**: never modified after construction
//! - **Versioned**: all four types share one version string
//! - **Pre-encoded**: resources are stored as marshaled protobuf payloads;
//!   the builder encodes once and streams copy bytes out

use std::collections::HashMap;

use flexds_core::ResourceKind;

/// One named, already-encoded resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    /// Resource name (cluster name, listener name, ...).
    pub name: String,
    /// Encoded protobuf payload. The type URL is implied by the kind of the
    /// set this entry lives in.
    pub body: Vec<u8>,
}

impl ResourceEntry {
    /// Create a new entry.
    pub fn new(name: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

/// Resources of a single kind within a snapshot, in build order.
#[derive(Debug, Clone, Default)]
pub struct ResourceSet {
    version: String,
    items: Vec<ResourceEntry>,
}

impl ResourceSet {
    /// Create a set with the given version and entries.
    pub fn new(version: impl Into<String>, items: Vec<ResourceEntry>) -> Self {
        Self {
            version: version.into(),
            items,
        }
    }

    /// Version string for this resource type.
    #[inline]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Number of resources.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the set is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate entries in build order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &ResourceEntry> {
        self.items.iter()
    }

    /// Look up an entry by resource name.
    pub fn get(&self, name: &str) -> Option<&ResourceEntry> {
        self.items.iter().find(|entry| entry.name == name)
    }
}

/// An immutable snapshot of all four resource types for one cache key.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: String,
    resources: HashMap<ResourceKind, ResourceSet>,
}

impl Snapshot {
    /// Create a new snapshot builder.
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::default()
    }

    /// The shared version of this snapshot.
    #[inline]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Resources of a specific kind, if the snapshot carries that kind.
    #[inline]
    pub fn resources(&self, kind: ResourceKind) -> Option<&ResourceSet> {
        self.resources.get(&kind)
    }

    /// The version for a specific kind.
    #[inline]
    pub fn version_of(&self, kind: ResourceKind) -> Option<&str> {
        self.resources.get(&kind).map(ResourceSet::version)
    }

    /// Total resources across all kinds.
    pub fn total_resources(&self) -> usize {
        self.resources.values().map(ResourceSet::len).sum()
    }

    /// Whether the snapshot carries no resources at all.
    pub fn is_empty(&self) -> bool {
        self.resources.values().all(ResourceSet::is_empty)
    }
}

/// Builder for [`Snapshot`].
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    version: String,
    resources: HashMap<ResourceKind, ResourceSet>,
}

impl SnapshotBuilder {
    /// Set the shared version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Add the resources of one kind. The per-kind version defaults to the
    /// shared version.
    pub fn resources(mut self, kind: ResourceKind, items: Vec<ResourceEntry>) -> Self {
        let set = ResourceSet::new(self.version.clone(), items);
        self.resources.insert(kind, set);
        self
    }

    /// Build the snapshot. Kinds that were never added are filled with empty
    /// sets so every kind always has a version.
    pub fn build(mut self) -> Snapshot {
        for kind in ResourceKind::ALL {
            self.resources
                .entry(kind)
                .or_insert_with(|| ResourceSet::new(self.version.clone(), Vec::new()));
        }
        Snapshot {
            version: self.version,
            resources: self.resources,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_all_kinds() {
        let snapshot = Snapshot::builder().version("1").build();
        assert_eq!(snapshot.version(), "1");
        assert!(snapshot.is_empty());
        for kind in ResourceKind::ALL {
            assert_eq!(snapshot.version_of(kind), Some("1"));
        }
    }

    #[test]
    fn resources_keep_build_order() {
        let snapshot = Snapshot::builder()
            .version("2")
            .resources(
                ResourceKind::Cluster,
                vec![
                    ResourceEntry::new("zeta", vec![1]),
                    ResourceEntry::new("alpha", vec![2]),
                ],
            )
            .build();

        let set = snapshot.resources(ResourceKind::Cluster).unwrap();
        let names: Vec<_> = set.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha"]);
        assert_eq!(set.get("alpha").unwrap().body, vec![2]);
        assert!(set.get("missing").is_none());
    }

    #[test]
    fn total_resources_spans_kinds() {
        let snapshot = Snapshot::builder()
            .version("3")
            .resources(
                ResourceKind::Cluster,
                vec![ResourceEntry::new("api", vec![])],
            )
            .resources(
                ResourceKind::Listener,
                vec![ResourceEntry::new("listener_18080", vec![])],
            )
            .build();
        assert_eq!(snapshot.total_resources(), 2);
        assert!(!snapshot.is_empty());
    }
}
