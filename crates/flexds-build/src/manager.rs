//! Snapshot manager: build, install under the reference key, fan out.

use std::sync::Arc;

use tracing::{debug, error, info};

use flexds_cache::SnapshotCache;
use flexds_core::{DiscoveredService, NodeKey, ResourceKind};

use crate::builder::build_snapshot;
use crate::metrics;

/// Owns the cache-installation side of the pipeline.
///
/// Every successful build is installed under the reference sentinel and then
/// copied to every client key currently inhabiting the cache, waking the
/// streams serving those clients. A failed build leaves the previous
/// snapshot in place everywhere.
#[derive(Debug)]
pub struct SnapshotManager {
    cache: Arc<SnapshotCache>,
    listener_ports: Vec<u16>,
}

impl SnapshotManager {
    /// Create a manager over the shared cache.
    pub fn new(cache: Arc<SnapshotCache>, listener_ports: Vec<u16>) -> Self {
        Self {
            cache,
            listener_ports,
        }
    }

    /// The shared cache.
    #[inline]
    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    /// Build a snapshot from the merged service set and push it.
    ///
    /// Build errors are terminal for this build only: they are logged and
    /// counted, and the previous snapshot remains current.
    pub fn build_and_push(&self, services: &[DiscoveredService]) {
        let snapshot = match build_snapshot(services, &self.listener_ports) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                error!(%error, "snapshot build failed, keeping previous snapshot");
                metrics::build_failures().inc();
                return;
            }
        };

        let version = snapshot.version().to_string();
        let counts: Vec<(ResourceKind, usize)> = ResourceKind::ALL
            .into_iter()
            .map(|kind| (kind, snapshot.resources(kind).map_or(0, |set| set.len())))
            .collect();

        self.cache.set(NodeKey::reference(), snapshot.clone());

        let keys = self.cache.keys();
        debug!(?keys, "fanning out snapshot");
        for key in keys {
            if key.is_reference() {
                continue;
            }
            self.cache.set(key, snapshot.clone());
        }

        info!(
            version = %version,
            clusters = counts[0].1,
            endpoints = counts[1].1,
            listeners = counts[2].1,
            routes = counts[3].1,
            "snapshot pushed"
        );
        metrics::snapshots_pushed().inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flexds_core::{MatchType, Rewrite, RoutePattern, ServiceInstance};

    fn routable(name: &str) -> DiscoveredService {
        DiscoveredService {
            name: name.to_string(),
            instances: vec![ServiceInstance::new("h1", 8080)],
            routes: vec![RoutePattern {
                name: format!("{name}-route-1"),
                match_type: MatchType::Path,
                path_prefix: format!("/{name}"),
                header_name: String::new(),
                header_value: String::new(),
                rewrite: Rewrite::None,
                hosts: RoutePattern::default_hosts(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn push_installs_reference_snapshot() {
        let cache = Arc::new(SnapshotCache::new());
        let manager = SnapshotManager::new(Arc::clone(&cache), vec![18080]);

        manager.build_and_push(&[routable("api")]);

        let reference = cache.get(&NodeKey::reference()).unwrap();
        assert_eq!(reference.resources(ResourceKind::Cluster).unwrap().len(), 1);
    }

    #[test]
    fn push_fans_out_to_known_clients() {
        let cache = Arc::new(SnapshotCache::new());
        let manager = SnapshotManager::new(Arc::clone(&cache), vec![18080]);

        // A client that connected earlier.
        let client = NodeKey::new("envoy-1");
        cache.set(client.clone(), flexds_cache::Snapshot::builder().version("0").build());

        manager.build_and_push(&[routable("api")]);

        let reference = cache.get(&NodeKey::reference()).unwrap();
        let client_snapshot = cache.get(&client).unwrap();
        assert_eq!(client_snapshot.version(), reference.version());
    }

    #[test]
    fn empty_service_set_pushes_empty_snapshot() {
        let cache = Arc::new(SnapshotCache::new());
        let manager = SnapshotManager::new(Arc::clone(&cache), vec![18080]);

        manager.build_and_push(&[routable("api")]);
        let before: u64 = cache.get(&NodeKey::reference()).unwrap().version().parse().unwrap();

        manager.build_and_push(&[]);
        let reference = cache.get(&NodeKey::reference()).unwrap();
        assert!(reference.is_empty());
        let after: u64 = reference.version().parse().unwrap();
        assert!(after > before);
    }
}
