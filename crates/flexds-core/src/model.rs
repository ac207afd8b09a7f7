//! The canonical in-memory service model.
//!
//! Every discovery source (Consul, Marathon, the static file) normalizes its
//! backend's view of the world into [`DiscoveredService`] values. The
//! aggregator merges them and the resource builder projects the merged set
//! into proxy configuration. Nothing downstream of a source ever sees
//! backend-specific types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// A single reachable instance of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Hostname or IP address.
    pub address: String,
    /// TCP port.
    pub port: u16,
}

impl ServiceInstance {
    /// Create a new instance.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

/// What a route matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// Path prefix only.
    #[default]
    Path,
    /// Header equality (the path prefix still applies, typically `/`).
    Header,
    /// Path prefix and header equality.
    Both,
}

impl MatchType {
    /// Whether this match type carries a header matcher.
    #[inline]
    pub fn matches_header(self) -> bool {
        matches!(self, MatchType::Header | MatchType::Both)
    }
}

impl FromStr for MatchType {
    type Err = crate::FlexdsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "path" => Ok(MatchType::Path),
            "header" => Ok(MatchType::Header),
            "both" => Ok(MatchType::Both),
            other => Err(crate::FlexdsError::parse(
                "match_type",
                format!("unknown value {other:?}"),
            )),
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchType::Path => "path",
            MatchType::Header => "header",
            MatchType::Both => "both",
        };
        f.write_str(s)
    }
}

/// Path rewrite applied when a route forwards upstream.
///
/// At most one rewrite applies per route. Sources that expose both a prefix
/// and a regex rewrite field resolve the conflict at construction: regex
/// wins.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Rewrite {
    /// Forward the path unchanged.
    #[default]
    None,
    /// Replace the matched prefix with the given string.
    Prefix(String),
    /// Regex match-and-substitute over the whole path.
    Regex {
        /// Pattern to match.
        pattern: String,
        /// Replacement, may reference capture groups.
        substitution: String,
    },
}

impl Rewrite {
    /// Build a rewrite from the raw optional prefix/regex fields sources
    /// carry on the wire. Regex takes priority when both are set.
    pub fn from_fields(prefix: &str, regex: &str, replacement: &str) -> Self {
        if !regex.is_empty() {
            Rewrite::Regex {
                pattern: regex.to_string(),
                substitution: replacement.to_string(),
            }
        } else if !prefix.is_empty() {
            Rewrite::Prefix(prefix.to_string())
        } else {
            Rewrite::None
        }
    }
}

/// A single routing rule for a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    /// Route name, for logging only.
    pub name: String,
    /// What the route matches on.
    pub match_type: MatchType,
    /// Path prefix to match. Required; routes without one are dropped by the
    /// parsers.
    pub path_prefix: String,
    /// Header name, for header and both matches.
    pub header_name: String,
    /// Header value, exact match.
    pub header_value: String,
    /// Upstream path rewrite.
    pub rewrite: Rewrite,
    /// Host domains this route serves.
    pub hosts: Vec<String>,
}

impl RoutePattern {
    /// Default host list (`*`).
    pub fn default_hosts() -> Vec<String> {
        vec!["*".to_string()]
    }
}

/// A service with its instances and routing configuration, as reported by
/// one discovery source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiscoveredService {
    /// Cluster identifier. Must be unique across the merged service set.
    pub name: String,
    /// Known instances. May be empty; such services contribute no resources.
    pub instances: Vec<ServiceInstance>,
    /// Routing patterns. May be empty; such services contribute no resources.
    pub routes: Vec<RoutePattern>,
    /// Speak HTTP/2 to upstream instances.
    pub enable_http2: bool,
    /// Wrap upstream connections in TLS.
    pub enable_tls: bool,
    /// Fixed DNS refresh rate. `None` means respect DNS TTLs.
    pub dns_refresh_rate: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_type_parsing() {
        assert_eq!("path".parse::<MatchType>().unwrap(), MatchType::Path);
        assert_eq!("header".parse::<MatchType>().unwrap(), MatchType::Header);
        assert_eq!("both".parse::<MatchType>().unwrap(), MatchType::Both);
        assert!("prefix".parse::<MatchType>().is_err());
    }

    #[test]
    fn match_type_header_flag() {
        assert!(!MatchType::Path.matches_header());
        assert!(MatchType::Header.matches_header());
        assert!(MatchType::Both.matches_header());
    }

    #[test]
    fn rewrite_regex_wins_over_prefix() {
        let rewrite = Rewrite::from_fields("/", "^/api(/.*)$", "$1");
        assert_eq!(
            rewrite,
            Rewrite::Regex {
                pattern: "^/api(/.*)$".into(),
                substitution: "$1".into(),
            }
        );
    }

    #[test]
    fn rewrite_prefix_without_regex() {
        assert_eq!(Rewrite::from_fields("/", "", ""), Rewrite::Prefix("/".into()));
        assert_eq!(Rewrite::from_fields("", "", ""), Rewrite::None);
    }
}
