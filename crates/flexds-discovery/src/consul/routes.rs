//! Route derivation from service registration metadata.
//!
//! Metadata keys of the form `route_<N>_<field>` define up to
//! [`MAX_ROUTES`] numbered routes per service:
//!
//! - `route_N_match_type`: `path`, `header`, or `both` (default `path`)
//! - `route_N_path_prefix`: required; the route is dropped without it
//! - `route_N_header_name` / `route_N_header_value`: exact header match
//! - `route_N_prefix_rewrite`: rewrite the matched prefix
//! - `route_N_regex_rewrite` / `route_N_regex_replacement`: regex rewrite,
//!   takes priority over the prefix rewrite

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use flexds_core::{MatchType, Rewrite, RoutePattern};

/// Highest supported route number.
pub const MAX_ROUTES: u32 = 10;

/// Parse the numbered route patterns out of a service's metadata.
pub fn parse_service_routes(service: &str, meta: &HashMap<String, String>) -> Vec<RoutePattern> {
    let mut numbered: BTreeMap<u32, HashMap<&str, &str>> = BTreeMap::new();
    for (key, value) in meta {
        let Some(rest) = key.strip_prefix("route_") else {
            continue;
        };
        let Some((number, field)) = rest.split_once('_') else {
            continue;
        };
        let Ok(number) = number.parse::<u32>() else {
            continue;
        };
        numbered.entry(number).or_default().insert(field, value);
    }

    let mut routes = Vec::new();
    for number in 1..=MAX_ROUTES {
        let Some(fields) = numbered.get(&number) else {
            continue;
        };
        let name = format!("{service}-route-{number}");

        let match_type = match fields.get("match_type") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(route = %name, value = %raw, "unknown match_type, falling back to path");
                MatchType::Path
            }),
            None => MatchType::Path,
        };

        let path_prefix = fields.get("path_prefix").copied().unwrap_or_default();
        if path_prefix.is_empty() {
            warn!(route = %name, "route has no path prefix, dropping");
            continue;
        }

        let pattern = RoutePattern {
            name,
            match_type,
            path_prefix: path_prefix.to_string(),
            header_name: fields.get("header_name").copied().unwrap_or_default().to_string(),
            header_value: fields.get("header_value").copied().unwrap_or_default().to_string(),
            rewrite: Rewrite::from_fields(
                fields.get("prefix_rewrite").copied().unwrap_or_default(),
                fields.get("regex_rewrite").copied().unwrap_or_default(),
                fields.get("regex_replacement").copied().unwrap_or_default(),
            ),
            hosts: RoutePattern::default_hosts(),
        };

        debug!(
            service = %service,
            route = %pattern.name,
            match_type = %pattern.match_type,
            path = %pattern.path_prefix,
            "parsed route"
        );
        routes.push(pattern);
    }

    routes
}
