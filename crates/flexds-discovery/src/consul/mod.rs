//! Service-registry discovery source.
//!
//! Watches the catalog with a blocking query and, on each dispatched
//! change, resolves every candidate service through the health API into
//! the common service model. Instance metadata comes from the most
//! recently modified healthy entry (the metadata leader).

mod client;
mod routes;
mod watcher;

pub use client::{AgentService, CatalogServices, ConsulClient, NodeInfo, ServiceEntry};
pub use routes::{parse_service_routes, MAX_ROUTES};
pub use watcher::{CatalogWatcher, WatcherKind};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use flexds_core::{DiscoveredService, FlexdsResult, ServiceInstance};

use crate::aggregator::ServiceAggregator;
use crate::metrics;

/// Aggregator slot owned by this source.
pub const SOURCE_ID: &str = "consul";

/// Registry source configuration.
#[derive(Debug, Clone)]
pub struct ConsulConfig {
    /// Registry HTTP address (`host:port`, scheme optional).
    pub addr: String,
    /// Server-side blocking-query wait window.
    pub wait_time: Duration,
    /// Update coalescing strategy.
    pub strategy: WatcherKind,
}

impl ConsulConfig {
    /// Config with the default 2 s wait window.
    pub fn new(addr: impl Into<String>, strategy: WatcherKind) -> Self {
        Self {
            addr: addr.into(),
            wait_time: Duration::from_secs(2),
            strategy,
        }
    }
}

/// The registry discovery source.
#[derive(Debug)]
pub struct ConsulSource {
    client: Arc<ConsulClient>,
    config: ConsulConfig,
    aggregator: Arc<ServiceAggregator>,
}

impl ConsulSource {
    /// Create the source. Fails only on client construction.
    pub fn new(config: ConsulConfig, aggregator: Arc<ServiceAggregator>) -> FlexdsResult<Self> {
        let client = Arc::new(ConsulClient::new(&config.addr)?);
        Ok(Self {
            client,
            config,
            aggregator,
        })
    }

    /// Run the watch loop until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> FlexdsResult<()> {
        let watcher = CatalogWatcher::new(
            (*self.client).clone(),
            self.config.wait_time,
            self.config.strategy,
        );

        let client = Arc::clone(&self.client);
        let aggregator = Arc::clone(&self.aggregator);
        watcher
            .watch(shutdown, move |services| {
                let client = Arc::clone(&client);
                let aggregator = Arc::clone(&aggregator);
                async move { resolve_and_update(&client, &aggregator, services).await }
            })
            .await
    }
}

/// Resolve candidate names through the health API and push the result into
/// the aggregator. Per-service failures skip that service only.
async fn resolve_and_update(
    client: &ConsulClient,
    aggregator: &ServiceAggregator,
    services: Vec<String>,
) -> FlexdsResult<()> {
    debug!(count = services.len(), "resolving candidate services");

    let mut discovered = Vec::with_capacity(services.len());
    for name in services {
        let entries = match client.healthy_instances(&name).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!(service = %name, %error, "failed fetching healthy entries");
                continue;
            }
        };
        if let Some(service) = convert_entries(&name, entries) {
            discovered.push(service);
        }
    }

    metrics::services_discovered(SOURCE_ID).set(discovered.len() as i64);
    aggregator.update(SOURCE_ID, discovered)
}

/// Convert one service's healthy entries into the common model.
///
/// Entries sort by modify index descending; the head entry is the metadata
/// leader. A service with no healthy entries, or whose leader carries no
/// usable address, contributes nothing.
fn convert_entries(name: &str, mut entries: Vec<ServiceEntry>) -> Option<DiscoveredService> {
    if entries.is_empty() {
        warn!(service = %name, "service has no healthy instances");
        return None;
    }

    entries.sort_by(|a, b| b.service.modify_index.cmp(&a.service.modify_index));

    let leader = &entries[0];
    if entry_address(leader).is_empty() {
        warn!(service = %name, "metadata leader has no address, skipping service");
        return None;
    }

    let instances: Vec<ServiceInstance> = entries
        .iter()
        .filter_map(|entry| {
            let address = entry_address(entry);
            if address.is_empty() {
                return None;
            }
            Some(ServiceInstance::new(address, entry.service.port))
        })
        .collect();

    let meta = &entries[0].service.meta;
    let enable_http2 = meta.get("http2").is_some_and(|value| value == "true");
    let dns_refresh_rate = meta
        .get("dns_refresh_rate")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|seconds| *seconds > 0)
        .map(Duration::from_secs);
    let routes = parse_service_routes(name, meta);

    Some(DiscoveredService {
        name: name.to_string(),
        instances,
        routes,
        enable_http2,
        enable_tls: false,
        dns_refresh_rate,
    })
}

/// Prefer the service's own address, falling back to the node's.
fn entry_address(entry: &ServiceEntry) -> &str {
    if entry.service.address.is_empty() {
        &entry.node.address
    } else {
        &entry.service.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entry(
        service_addr: &str,
        node_addr: &str,
        port: u16,
        modify_index: u64,
        meta: &[(&str, &str)],
    ) -> ServiceEntry {
        ServiceEntry {
            node: NodeInfo {
                address: node_addr.to_string(),
            },
            service: AgentService {
                service: "py-web".to_string(),
                address: service_addr.to_string(),
                port,
                meta: meta
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<HashMap<_, _>>(),
                modify_index,
            },
        }
    }

    #[test]
    fn address_falls_back_to_node() {
        let with_service_addr = entry("svc.internal", "10.0.0.1", 80, 1, &[]);
        assert_eq!(entry_address(&with_service_addr), "svc.internal");

        let node_only = entry("", "10.0.0.1", 80, 1, &[]);
        assert_eq!(entry_address(&node_only), "10.0.0.1");
    }

    #[test]
    fn leader_is_highest_modify_index() {
        let entries = vec![
            entry("old.internal", "", 80, 3, &[("http2", "false")]),
            entry("new.internal", "", 80, 9, &[
                ("http2", "true"),
                ("route_1_path_prefix", "/py-web"),
            ]),
        ];

        let service = convert_entries("py-web", entries).unwrap();
        assert!(service.enable_http2, "metadata comes from the newest entry");
        assert_eq!(service.routes.len(), 1);
        // Instances keep leader-first order.
        assert_eq!(service.instances[0].address, "new.internal");
        assert_eq!(service.instances.len(), 2);
    }

    #[test]
    fn no_entries_means_no_service() {
        assert!(convert_entries("py-web", vec![]).is_none());
    }

    #[test]
    fn leader_without_address_skips_service() {
        let entries = vec![
            entry("", "", 80, 9, &[("route_1_path_prefix", "/py-web")]),
            entry("ok.internal", "", 80, 1, &[]),
        ];
        assert!(convert_entries("py-web", entries).is_none());
    }

    #[test]
    fn addressless_followers_are_dropped() {
        let entries = vec![
            entry("lead.internal", "", 80, 9, &[("route_1_path_prefix", "/p")]),
            entry("", "", 80, 5, &[]),
        ];
        let service = convert_entries("py-web", entries).unwrap();
        assert_eq!(service.instances.len(), 1);
    }

    #[test]
    fn dns_refresh_rate_parses_positive_seconds() {
        let make = |value: &str| {
            convert_entries(
                "py-web",
                vec![entry("a.internal", "", 80, 1, &[
                    ("dns_refresh_rate", value),
                    ("route_1_path_prefix", "/p"),
                ])],
            )
            .unwrap()
        };
        assert_eq!(make("90").dns_refresh_rate, Some(Duration::from_secs(90)));
        assert_eq!(make("0").dns_refresh_rate, None);
        assert_eq!(make("soon").dns_refresh_rate, None);
    }
}
