//! Minimal Consul HTTP API client.
//!
//! FlexDS needs exactly two endpoints: the blocking catalog listing (for
//! change detection) and the health-filtered service listing (for instance
//! resolution). Both are spoken directly over HTTP.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use flexds_core::{FlexdsError, FlexdsResult};

use super::SOURCE_ID;

/// Result of one blocking catalog query.
#[derive(Debug)]
pub struct CatalogServices {
    /// The catalog index reported by the registry.
    pub index: u64,
    /// All service names in the catalog.
    pub services: Vec<String>,
}

/// One entry from the health-filtered service listing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEntry {
    /// The node hosting the instance.
    #[serde(default)]
    pub node: NodeInfo,
    /// The registered service instance.
    #[serde(default)]
    pub service: AgentService,
}

/// Node half of a [`ServiceEntry`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeInfo {
    /// Node address, the fallback when the service has none of its own.
    #[serde(default)]
    pub address: String,
}

/// Service half of a [`ServiceEntry`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    /// Registered service name.
    #[serde(default)]
    pub service: String,
    /// Service address; empty when the node address applies.
    #[serde(default)]
    pub address: String,
    /// Service port.
    #[serde(default)]
    pub port: u16,
    /// Registration metadata (`route_<N>_<field>`, `http2`, ...).
    #[serde(default)]
    pub meta: HashMap<String, String>,
    /// Raft index of the last modification; highest wins metadata
    /// leadership.
    #[serde(default)]
    pub modify_index: u64,
}

/// HTTP client for the registry.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base_url: String,
}

impl ConsulClient {
    /// Create a client for `addr` (`host:port`, scheme optional).
    pub fn new(addr: &str) -> FlexdsResult<Self> {
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| FlexdsError::discovery(SOURCE_ID, "failed to build HTTP client", err))?;
        Ok(Self { http, base_url })
    }

    /// Blocking catalog query: returns once the catalog index advances past
    /// `wait_index` or after the registry's `wait` window elapses.
    pub async fn catalog_services(
        &self,
        wait_index: u64,
        wait: Duration,
    ) -> FlexdsResult<CatalogServices> {
        let url = format!("{}/v1/catalog/services", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("index", wait_index.to_string()),
                ("wait", format!("{}s", wait.as_secs())),
            ])
            .send()
            .await
            .map_err(|err| FlexdsError::discovery(SOURCE_ID, "catalog query failed", err))?
            .error_for_status()
            .map_err(|err| FlexdsError::discovery(SOURCE_ID, "catalog query rejected", err))?;

        let index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(wait_index);

        let services: HashMap<String, Vec<String>> = response
            .json()
            .await
            .map_err(|err| FlexdsError::parse("consul catalog response", err))?;

        Ok(CatalogServices {
            index,
            services: services.into_keys().collect(),
        })
    }

    /// Health-filtered instance listing: passing instances only.
    pub async fn healthy_instances(&self, service: &str) -> FlexdsResult<Vec<ServiceEntry>> {
        let url = format!("{}/v1/health/service/{service}", self.base_url);
        self.http
            .get(&url)
            .query(&[("passing", "true")])
            .send()
            .await
            .map_err(|err| FlexdsError::discovery(SOURCE_ID, "health query failed", err))?
            .error_for_status()
            .map_err(|err| FlexdsError::discovery(SOURCE_ID, "health query rejected", err))?
            .json()
            .await
            .map_err(|err| FlexdsError::parse("consul health response", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_a_scheme() {
        let client = ConsulClient::new("localhost:8500").unwrap();
        assert_eq!(client.base_url, "http://localhost:8500");

        let client = ConsulClient::new("https://consul.internal:8501/").unwrap();
        assert_eq!(client.base_url, "https://consul.internal:8501");
    }

    #[test]
    fn service_entry_deserializes_consul_shape() {
        let raw = r#"
        {
            "Node": { "Node": "worker-1", "Address": "10.0.0.5" },
            "Service": {
                "ID": "py-web-1",
                "Service": "py-web",
                "Address": "py-web.internal",
                "Port": 8080,
                "Meta": { "http2": "true", "route_1_path_prefix": "/py-web" },
                "ModifyIndex": 42
            },
            "Checks": []
        }"#;

        let entry: ServiceEntry = serde_json::from_str(raw).unwrap();
        assert_eq!(entry.node.address, "10.0.0.5");
        assert_eq!(entry.service.service, "py-web");
        assert_eq!(entry.service.address, "py-web.internal");
        assert_eq!(entry.service.port, 8080);
        assert_eq!(entry.service.modify_index, 42);
        assert_eq!(entry.service.meta["http2"], "true");
    }

    #[test]
    fn missing_fields_default() {
        let entry: ServiceEntry = serde_json::from_str(r#"{ "Service": { "Service": "x" } }"#).unwrap();
        assert!(entry.node.address.is_empty());
        assert_eq!(entry.service.port, 0);
        assert_eq!(entry.service.modify_index, 0);
    }
}
