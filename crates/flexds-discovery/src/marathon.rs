//! Batch-scheduler discovery source, polled over HTTP.
//!
//! Every interval the app catalog is fetched and converted: one service
//! per app and port definition, named `mesos_<sanitized-app-id>_<port>`,
//! with instances drawn from healthy tasks. Each service gets a path route
//! `/<routing-key>` (rewritten to `/`) and a `destination_service` header
//! route, where the routing key is the `routing_key` label or the service
//! name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use flexds_core::{
    DiscoveredService, FlexdsError, FlexdsResult, MatchType, Rewrite, RoutePattern,
    ServiceInstance,
};

use crate::aggregator::ServiceAggregator;
use crate::metrics;

/// Aggregator slot owned by this source.
pub const SOURCE_ID: &str = "marathon";

/// Poll source configuration.
#[derive(Debug, Clone)]
pub struct MarathonConfig {
    /// Base URL of the app catalog.
    pub url: String,
    /// Optional credentials file holding a single `user:pass` line.
    pub credentials_path: Option<PathBuf>,
    /// Poll interval.
    pub interval: Duration,
}

#[derive(Debug, Deserialize)]
struct AppCatalog {
    #[serde(default)]
    apps: Vec<App>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct App {
    id: String,
    port_definitions: Vec<PortDefinition>,
    tasks: Vec<Task>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PortDefinition {
    name: String,
    labels: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Task {
    id: String,
    host: String,
    ip_addresses: Vec<IpAddress>,
    ports: Vec<u16>,
    health_check_results: Vec<HealthCheckResult>,
    state: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct IpAddress {
    ip_address: String,
    protocol: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct HealthCheckResult {
    alive: bool,
}

impl Task {
    /// Running with at least one live health check.
    fn is_healthy(&self) -> bool {
        self.state == "TASK_RUNNING" && self.health_check_results.iter().any(|check| check.alive)
    }

    /// First IPv4 task address, falling back to the agent host.
    fn address(&self) -> &str {
        self.ip_addresses
            .iter()
            .find(|ip| ip.protocol == "IPv4" && !ip.ip_address.is_empty())
            .map(|ip| ip.ip_address.as_str())
            .unwrap_or(&self.host)
    }
}

/// The poll source.
#[derive(Debug)]
pub struct MarathonSource {
    http: reqwest::Client,
    config: MarathonConfig,
    credentials: Option<(String, String)>,
    aggregator: Arc<ServiceAggregator>,
}

impl MarathonSource {
    /// Create the source, reading credentials up front so a malformed
    /// credentials file fails startup rather than every poll.
    pub fn new(config: MarathonConfig, aggregator: Arc<ServiceAggregator>) -> FlexdsResult<Self> {
        let credentials = config
            .credentials_path
            .as_deref()
            .map(read_credentials)
            .transpose()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| FlexdsError::discovery(SOURCE_ID, "failed to build HTTP client", err))?;
        Ok(Self {
            http,
            config,
            credentials,
            aggregator,
        })
    }

    /// Poll until shutdown. The first poll happens immediately; failures
    /// are logged and the next tick carries on.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> FlexdsResult<()> {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(url = %self.config.url, interval = ?self.config.interval, "starting app catalog poll");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("stopping app catalog poll");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(error) = self.poll().await {
                        warn!(%error, "app catalog poll failed");
                    }
                }
            }
        }
    }

    async fn poll(&self) -> FlexdsResult<()> {
        debug!("polling app catalog");
        let url = format!(
            "{}/v2/apps?embed=apps.tasks",
            self.config.url.trim_end_matches('/')
        );
        let mut request = self.http.get(&url);
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }

        let catalog: AppCatalog = request
            .send()
            .await
            .map_err(|err| FlexdsError::discovery(SOURCE_ID, "failed to fetch app catalog", err))?
            .error_for_status()
            .map_err(|err| FlexdsError::discovery(SOURCE_ID, "app catalog rejected request", err))?
            .json()
            .await
            .map_err(|err| FlexdsError::parse("marathon response", err))?;

        let services = convert_apps(catalog.apps);
        metrics::services_discovered(SOURCE_ID).set(services.len() as i64);
        self.aggregator.update(SOURCE_ID, services)
    }
}

fn read_credentials(path: &Path) -> FlexdsResult<(String, String)> {
    let raw = std::fs::read_to_string(path)?;
    match raw.trim().split_once(':') {
        Some((user, pass)) if !user.is_empty() => Ok((user.to_string(), pass.to_string())),
        _ => Err(FlexdsError::Configuration(format!(
            "invalid credentials format in {}",
            path.display()
        ))),
    }
}

fn sanitize_app_id(id: &str) -> String {
    id.strip_prefix('/').unwrap_or(id).replace(['/', '-'], "_")
}

fn convert_apps(apps: Vec<App>) -> Vec<DiscoveredService> {
    let mut services = Vec::new();

    for app in &apps {
        let healthy: Vec<&Task> = app.tasks.iter().filter(|task| task.is_healthy()).collect();
        if healthy.is_empty() {
            continue;
        }

        for (port_index, port_def) in app.port_definitions.iter().enumerate() {
            let service_name = format!("mesos_{}_{}", sanitize_app_id(&app.id), port_def.name);

            let mut instances = Vec::with_capacity(healthy.len());
            for task in &healthy {
                let Some(&port) = task.ports.get(port_index) else {
                    warn!(
                        service = %service_name,
                        task = %task.id,
                        port_index,
                        "task exposes no port at definition index, skipping instance"
                    );
                    continue;
                };
                instances.push(ServiceInstance::new(task.address(), port));
            }

            let enable_http2 = port_def.name == "grpc"
                || port_def.labels.get("http2").is_some_and(|value| value == "true");

            services.push(DiscoveredService {
                routes: build_routes(&service_name, &port_def.labels),
                name: service_name,
                instances,
                enable_http2,
                ..Default::default()
            });
        }
    }

    services
}

fn build_routes(service_name: &str, labels: &HashMap<String, String>) -> Vec<RoutePattern> {
    let routing_key = labels
        .get("routing_key")
        .filter(|key| !key.is_empty())
        .map(String::as_str)
        .unwrap_or(service_name);

    vec![
        RoutePattern {
            name: format!("{service_name}-route-prefix"),
            match_type: MatchType::Path,
            path_prefix: format!("/{routing_key}"),
            header_name: String::new(),
            header_value: String::new(),
            rewrite: Rewrite::Prefix("/".to_string()),
            hosts: RoutePattern::default_hosts(),
        },
        RoutePattern {
            name: format!("{service_name}-route-header"),
            match_type: MatchType::Header,
            path_prefix: String::new(),
            header_name: "destination_service".to_string(),
            header_value: routing_key.to_string(),
            rewrite: Rewrite::None,
            hosts: RoutePattern::default_hosts(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
    {
        "apps": [
            {
                "id": "/web/py-api",
                "ports": [10004],
                "portDefinitions": [
                    { "port": 10004, "name": "http", "labels": { "routing_key": "py-api" } },
                    { "port": 10005, "name": "grpc", "labels": {} }
                ],
                "tasks": [
                    {
                        "id": "web_py-api.1",
                        "host": "agent-1",
                        "ipAddresses": [{ "ipAddress": "10.1.2.3", "protocol": "IPv4" }],
                        "ports": [31001, 31002],
                        "healthCheckResults": [{ "alive": true }],
                        "state": "TASK_RUNNING"
                    },
                    {
                        "id": "web_py-api.2",
                        "host": "agent-2",
                        "ipAddresses": [],
                        "ports": [31101, 31102],
                        "healthCheckResults": [{ "alive": false }],
                        "state": "TASK_RUNNING"
                    },
                    {
                        "id": "web_py-api.3",
                        "host": "agent-3",
                        "ipAddresses": [{ "ipAddress": "10.1.2.9", "protocol": "IPv4" }],
                        "ports": [31201, 31202],
                        "healthCheckResults": [{ "alive": true }],
                        "state": "TASK_STAGING"
                    }
                ]
            }
        ]
    }"#;

    fn sample_apps() -> Vec<App> {
        serde_json::from_str::<AppCatalog>(SAMPLE).unwrap().apps
    }

    #[test]
    fn health_requires_running_and_alive() {
        let apps = sample_apps();
        let healthy: Vec<_> = apps[0].tasks.iter().filter(|t| t.is_healthy()).collect();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "web_py-api.1");
    }

    #[test]
    fn task_address_prefers_ipv4() {
        let apps = sample_apps();
        assert_eq!(apps[0].tasks[0].address(), "10.1.2.3");
        assert_eq!(apps[0].tasks[1].address(), "agent-2");
    }

    #[test]
    fn app_id_sanitization() {
        assert_eq!(sanitize_app_id("/web/py-api"), "web_py_api");
        assert_eq!(sanitize_app_id("plain"), "plain");
    }

    #[test]
    fn conversion_emits_one_service_per_port_definition() {
        let services = convert_apps(sample_apps());
        assert_eq!(services.len(), 2);

        let http = &services[0];
        assert_eq!(http.name, "mesos_web_py_api_http");
        assert!(!http.enable_http2);
        assert_eq!(http.instances.len(), 1);
        assert_eq!(http.instances[0], ServiceInstance::new("10.1.2.3", 31001));

        // Second port definition maps to the task's second port and the
        // grpc port name switches HTTP/2 on.
        let grpc = &services[1];
        assert_eq!(grpc.name, "mesos_web_py_api_grpc");
        assert!(grpc.enable_http2);
        assert_eq!(grpc.instances[0].port, 31002);
    }

    #[test]
    fn routing_key_label_drives_routes() {
        let services = convert_apps(sample_apps());

        let http_routes = &services[0].routes;
        assert_eq!(http_routes.len(), 2);
        assert_eq!(http_routes[0].path_prefix, "/py-api");
        assert_eq!(http_routes[0].rewrite, Rewrite::Prefix("/".into()));
        assert_eq!(http_routes[1].header_name, "destination_service");
        assert_eq!(http_routes[1].header_value, "py-api");

        // No routing_key label: the service name is the key.
        let grpc_routes = &services[1].routes;
        assert_eq!(grpc_routes[0].path_prefix, "/mesos_web_py_api_grpc");
        assert_eq!(grpc_routes[1].header_value, "mesos_web_py_api_grpc");
    }

    #[test]
    fn unhealthy_app_contributes_nothing() {
        let raw = r#"{ "apps": [{ "id": "/idle", "portDefinitions": [{ "name": "http" }], "tasks": [] }] }"#;
        let catalog: AppCatalog = serde_json::from_str(raw).unwrap();
        assert!(convert_apps(catalog.apps).is_empty());
    }

    #[test]
    fn short_port_list_skips_instance() {
        let raw = r#"
        {
            "apps": [{
                "id": "/short",
                "portDefinitions": [{ "name": "http" }, { "name": "admin" }],
                "tasks": [{
                    "id": "short.1",
                    "host": "agent-1",
                    "ports": [31001],
                    "healthCheckResults": [{ "alive": true }],
                    "state": "TASK_RUNNING"
                }]
            }]
        }"#;
        let catalog: AppCatalog = serde_json::from_str(raw).unwrap();
        let services = convert_apps(catalog.apps);
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].instances.len(), 1);
        assert!(services[1].instances.is_empty());
    }

    #[test]
    fn credentials_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds");

        std::fs::write(&path, "scraper:s3cret\n").unwrap();
        assert_eq!(
            read_credentials(&path).unwrap(),
            ("scraper".to_string(), "s3cret".to_string())
        );

        std::fs::write(&path, "no-separator\n").unwrap();
        assert!(matches!(
            read_credentials(&path),
            Err(FlexdsError::Configuration(_))
        ));
    }
}
