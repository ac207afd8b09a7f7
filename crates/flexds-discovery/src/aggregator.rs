//! Aggregation of per-source service sets.
//!
//! Every source owns one slot, replaced wholesale on each of its updates.
//! Slots merge in lexicographic source-ID order; when two sources report
//! the same service name, the slot updated most recently wins and the
//! conflict is logged. The merged set feeds the snapshot manager while the
//! aggregator lock is held, so concurrent source updates serialize into a
//! total order of builds.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tracing::{debug, warn};

use flexds_build::SnapshotManager;
use flexds_core::{DiscoveredService, FlexdsResult};

#[derive(Debug)]
pub(crate) struct SourceSlot {
    /// Update sequence number; higher means applied later.
    pub(crate) seq: u64,
    pub(crate) services: Vec<DiscoveredService>,
}

#[derive(Debug, Default)]
struct AggregatorState {
    slots: BTreeMap<String, SourceSlot>,
    next_seq: u64,
}

/// The single owner of the merged service set.
#[derive(Debug)]
pub struct ServiceAggregator {
    state: Mutex<AggregatorState>,
    manager: SnapshotManager,
}

impl ServiceAggregator {
    /// Create an aggregator that feeds the given snapshot manager.
    pub fn new(manager: SnapshotManager) -> Self {
        Self {
            state: Mutex::new(AggregatorState::default()),
            manager,
        }
    }

    /// Replace `source_id`'s slot with `services` and rebuild.
    ///
    /// Safe to call from any task; updates serialize on an internal lock.
    /// An update with an unchanged service list still rebuilds and pushes
    /// (self-heal). Rebuild failures are logged by the snapshot manager;
    /// only structural errors surface here.
    pub fn update(
        &self,
        source_id: &str,
        services: Vec<DiscoveredService>,
    ) -> FlexdsResult<()> {
        let mut state = self.state.lock().expect("aggregator lock poisoned");
        state.next_seq += 1;
        let seq = state.next_seq;
        state
            .slots
            .insert(source_id.to_string(), SourceSlot { seq, services });

        let merged = merge(&state.slots);
        debug!(
            source = source_id,
            merged = merged.len(),
            "source updated, rebuilding snapshot"
        );

        // Build under the lock: concurrent updates must install snapshots
        // in version order.
        self.manager.build_and_push(&merged);
        Ok(())
    }
}

/// Merge all slots in lexicographic source order, resolving duplicate
/// service names in favour of the most recently applied slot. Positions are
/// stable: a winning duplicate replaces the loser in place.
pub(crate) fn merge(slots: &BTreeMap<String, SourceSlot>) -> Vec<DiscoveredService> {
    let mut merged: Vec<DiscoveredService> = Vec::new();
    let mut claims: HashMap<String, (usize, u64, String)> = HashMap::new();

    for (source_id, slot) in slots {
        for svc in &slot.services {
            let existing = claims
                .get(&svc.name)
                .map(|(index, seq, owner)| (*index, *seq, owner.clone()));
            match existing {
                None => {
                    claims.insert(
                        svc.name.clone(),
                        (merged.len(), slot.seq, source_id.clone()),
                    );
                    merged.push(svc.clone());
                }
                Some((index, seq, owner)) if slot.seq >= seq => {
                    warn!(
                        service = %svc.name,
                        winner = %source_id,
                        loser = %owner,
                        "duplicate service name, most recently updated source wins"
                    );
                    merged[index] = svc.clone();
                    claims.insert(svc.name.clone(), (index, slot.seq, source_id.clone()));
                }
                Some((_, _, owner)) => {
                    warn!(
                        service = %svc.name,
                        winner = %owner,
                        loser = %source_id,
                        "duplicate service name, most recently updated source wins"
                    );
                }
            }
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use flexds_cache::SnapshotCache;
    use flexds_core::{MatchType, NodeKey, ResourceKind, Rewrite, RoutePattern, ServiceInstance};

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

    fn slot(seq: u64, names: &[&str]) -> SourceSlot {
        SourceSlot {
            seq,
            services: names.iter().map(|n| routable(n)).collect(),
        }
    }

    #[test]
    fn merge_orders_sources_lexicographically() {
        let mut slots = BTreeMap::new();
        slots.insert("zeta".to_string(), slot(1, &["z1", "z2"]));
        slots.insert("alpha".to_string(), slot(2, &["a1"]));

        let merged = merge(&slots);
        let names: Vec<_> = merged.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a1", "z1", "z2"]);
    }

    #[test]
    fn merge_later_applied_source_wins_duplicates() {
        let mut slots = BTreeMap::new();
        let mut file_api = routable("api");
        file_api.enable_http2 = true;
        slots.insert(
            "file".to_string(),
            SourceSlot {
                seq: 1,
                services: vec![file_api],
            },
        );
        slots.insert("marathon".to_string(), slot(2, &["api"]));

        let merged = merge(&slots);
        assert_eq!(merged.len(), 1);
        // marathon updated later (seq 2), so its definition wins.
        assert!(!merged[0].enable_http2);

        // Refresh the file slot: now it is the most recent and reclaims the
        // name.
        slots.get_mut("file").unwrap().seq = 3;
        slots.get_mut("file").unwrap().services[0].enable_http2 = true;
        let merged = merge(&slots);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].enable_http2);
    }

    #[test]
    fn merge_duplicate_within_one_slot_keeps_last() {
        let mut slots = BTreeMap::new();
        let mut first = routable("api");
        first.enable_tls = false;
        let mut second = routable("api");
        second.enable_tls = true;
        slots.insert(
            "file".to_string(),
            SourceSlot {
                seq: 1,
                services: vec![first, second],
            },
        );

        let merged = merge(&slots);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].enable_tls);
    }

    #[test]
    fn update_replaces_slot_and_pushes() {
        let cache = Arc::new(SnapshotCache::new());
        let aggregator = ServiceAggregator::new(SnapshotManager::new(
            Arc::clone(&cache),
            vec![18080],
        ));

        aggregator.update("file", vec![routable("a"), routable("b")]).unwrap();
        let snapshot = cache.get(&NodeKey::reference()).unwrap();
        assert_eq!(snapshot.resources(ResourceKind::Cluster).unwrap().len(), 2);

        // Full replacement: the next update drops `b`.
        aggregator.update("file", vec![routable("a")]).unwrap();
        let snapshot = cache.get(&NodeKey::reference()).unwrap();
        assert_eq!(snapshot.resources(ResourceKind::Cluster).unwrap().len(), 1);
    }

    #[test]
    fn idempotent_update_still_pushes() {
        let cache = Arc::new(SnapshotCache::new());
        let aggregator = ServiceAggregator::new(SnapshotManager::new(
            Arc::clone(&cache),
            vec![18080],
        ));

        aggregator.update("file", vec![routable("a")]).unwrap();
        let first: u64 = cache
            .get(&NodeKey::reference())
            .unwrap()
            .version()
            .parse()
            .unwrap();

        aggregator.update("file", vec![routable("a")]).unwrap();
        let second: u64 = cache
            .get(&NodeKey::reference())
            .unwrap()
            .version()
            .parse()
            .unwrap();
        assert!(second > first, "identical input still produces a push");
    }

    #[test]
    fn duplicate_across_sources_yields_one_cluster() {
        let cache = Arc::new(SnapshotCache::new());
        let aggregator = ServiceAggregator::new(SnapshotManager::new(
            Arc::clone(&cache),
            vec![18080],
        ));

        aggregator.update("file", vec![routable("api")]).unwrap();
        aggregator.update("marathon", vec![routable("api")]).unwrap();

        let snapshot = cache.get(&NodeKey::reference()).unwrap();
        let clusters = snapshot.resources(ResourceKind::Cluster).unwrap();
        assert_eq!(clusters.len(), 1);
        assert!(clusters.get("api").is_some());
    }
}
