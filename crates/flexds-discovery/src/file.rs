//! Declarative file source.
//!
//! Read once at startup; parse errors are fatal. The format is a YAML list
//! of services:
//!
//! ```yaml
//! - name: hello
//!   instances:
//!     - host: hello.internal
//!       port: 8080
//!   routes:
//!     - match_type: path
//!       path_prefix: /hello
//!       prefix_rewrite: /
//!   http2: false
//!   tls: false
//!   dns_refresh_rate: 90s
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::info;

use flexds_core::{
    DiscoveredService, FlexdsError, FlexdsResult, MatchType, Rewrite, RoutePattern,
    ServiceInstance,
};

use crate::aggregator::ServiceAggregator;

/// Aggregator slot owned by this source.
pub const SOURCE_ID: &str = "file";

#[derive(Debug, Deserialize)]
struct ServiceSpec {
    name: String,
    #[serde(default)]
    instances: Vec<InstanceSpec>,
    #[serde(default)]
    routes: Vec<RouteSpec>,
    #[serde(default)]
    http2: bool,
    #[serde(default)]
    tls: bool,
    #[serde(default, deserialize_with = "parse_opt_duration")]
    dns_refresh_rate: Option<Duration>,
}

#[derive(Debug, Deserialize)]
struct InstanceSpec {
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct RouteSpec {
    #[serde(default)]
    match_type: MatchType,
    #[serde(default)]
    path_prefix: String,
    #[serde(default)]
    prefix_rewrite: String,
    #[serde(default)]
    regex_rewrite: String,
    #[serde(default)]
    regex_replacement: String,
    #[serde(default)]
    header_name: String,
    #[serde(default)]
    header_value: String,
}

/// Duration strings like `90s` or `2m 30s`.
fn parse_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|value| humantime::parse_duration(&value).map_err(serde::de::Error::custom))
        .transpose()
}

/// Load the file and install its services in the aggregator.
///
/// Any error here is a startup error; the caller treats it as fatal.
pub fn load(path: &Path, aggregator: &ServiceAggregator) -> FlexdsResult<()> {
    let raw = std::fs::read_to_string(path)?;
    let services = parse_services(&raw)?;
    info!(
        path = %path.display(),
        count = services.len(),
        "loaded services from file"
    );
    aggregator.update(SOURCE_ID, services)
}

fn parse_services(raw: &str) -> FlexdsResult<Vec<DiscoveredService>> {
    let specs: Vec<ServiceSpec> =
        serde_yaml::from_str(raw).map_err(|err| FlexdsError::parse("service file", err))?;
    Ok(specs.into_iter().map(into_service).collect())
}

fn into_service(spec: ServiceSpec) -> DiscoveredService {
    let routes = spec
        .routes
        .iter()
        .enumerate()
        .map(|(index, route)| RoutePattern {
            name: format!("{}-route-{}", spec.name, index),
            match_type: route.match_type,
            path_prefix: route.path_prefix.clone(),
            header_name: route.header_name.clone(),
            header_value: route.header_value.clone(),
            rewrite: Rewrite::from_fields(
                &route.prefix_rewrite,
                &route.regex_rewrite,
                &route.regex_replacement,
            ),
            hosts: RoutePattern::default_hosts(),
        })
        .collect();

    DiscoveredService {
        instances: spec
            .instances
            .into_iter()
            .map(|instance| ServiceInstance::new(instance.host, instance.port))
            .collect(),
        routes,
        name: spec.name,
        enable_http2: spec.http2,
        enable_tls: spec.tls,
        dns_refresh_rate: spec.dns_refresh_rate,
    }
}
