//! The xDS resource kinds FlexDS serves.

use std::fmt;

/// The four resource types delivered over ADS.
///
/// The declaration order of [`ResourceKind::ALL`] follows the CDS → EDS →
/// LDS → RDS ordering Envoy prefers for make-before-break updates; the
/// server iterates it when pushing snapshot changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Cluster Discovery Service.
    Cluster,
    /// Endpoint Discovery Service (ClusterLoadAssignment).
    Endpoint,
    /// Listener Discovery Service.
    Listener,
    /// Route Discovery Service (RouteConfiguration).
    Route,
}

impl ResourceKind {
    /// All served kinds, in push-preference order.
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cluster,
        ResourceKind::Endpoint,
        ResourceKind::Listener,
        ResourceKind::Route,
    ];

    /// The type URL clients use to request this kind.
    pub const fn type_url(self) -> &'static str {
        match self {
            ResourceKind::Cluster => "type.googleapis.com/envoy.config.cluster.v3.Cluster",
            ResourceKind::Endpoint => {
                "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment"
            }
            ResourceKind::Listener => "type.googleapis.com/envoy.config.listener.v3.Listener",
            ResourceKind::Route => {
                "type.googleapis.com/envoy.config.route.v3.RouteConfiguration"
            }
        }
    }

    /// Resolve a request type URL to a kind. `None` for anything FlexDS does
    /// not serve (SDS, RTDS, ...).
    pub fn from_type_url(url: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.type_url() == url)
    }

    /// Short human-readable name for logs.
    pub const fn short_name(self) -> &'static str {
        match self {
            ResourceKind::Cluster => "Cluster",
            ResourceKind::Endpoint => "ClusterLoadAssignment",
            ResourceKind::Listener => "Listener",
            ResourceKind::Route => "RouteConfiguration",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_url_round_trip() {
        for kind in ResourceKind::ALL {
            assert_eq!(ResourceKind::from_type_url(kind.type_url()), Some(kind));
        }
    }

    #[test]
    fn unknown_type_url() {
        assert_eq!(
            ResourceKind::from_type_url(
                "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret"
            ),
            None
        );
    }

    #[test]
    fn push_order_is_cds_first() {
        assert_eq!(ResourceKind::ALL[0], ResourceKind::Cluster);
        assert_eq!(ResourceKind::ALL[3], ResourceKind::Route);
    }
}
