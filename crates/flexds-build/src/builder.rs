//! The resource builder: service set in, proxy resource set out.
//!
//! A service contributes resources iff it has at least one instance with a
//! non-empty address and at least one route. Per routable service the build
//! emits a strict-DNS cluster with an inlined load assignment; all routes
//! land in a single `local_route` route configuration behind a wildcard
//! virtual host, in input order (first match wins at the proxy). One
//! listener is emitted per configured port, each running an AUTO-codec HTTP
//! connection manager that resolves `local_route` through RDS over ADS.
//!
//! Any encoding failure aborts the whole build so the caller keeps serving
//! the previous snapshot.

use prost::Message;
use tracing::{debug, info, warn};

use data_plane_api::envoy::config::cluster::v3::{cluster, Cluster};
use data_plane_api::envoy::config::core::v3::{
    address, config_source, socket_address, transport_socket, Address, AggregatedConfigSource,
    ApiVersion, ConfigSource, Http2ProtocolOptions, SocketAddress, TransportSocket,
};
use data_plane_api::envoy::config::endpoint::v3::{
    lb_endpoint, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use data_plane_api::envoy::config::listener::v3::{filter, Filter, FilterChain, Listener};
use data_plane_api::envoy::config::route::v3::{
    header_matcher, route, route_action, route_match, HeaderMatcher, Route, RouteAction,
    RouteConfiguration, RouteMatch, VirtualHost,
};
use data_plane_api::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager, http_filter, HttpConnectionManager, HttpFilter, Rds,
};
use data_plane_api::envoy::extensions::transport_sockets::tls::v3::{
    certificate_validation_context, common_tls_context, CertificateValidationContext,
    CommonTlsContext, UpstreamTlsContext,
};
use data_plane_api::envoy::extensions::upstreams::http::v3::{
    http_protocol_options, HttpProtocolOptions,
};
use data_plane_api::envoy::r#type::matcher::v3::{
    string_matcher, RegexMatchAndSubstitute, RegexMatcher, StringMatcher,
};
use data_plane_api::google::protobuf::{Any, Duration as ProtoDuration};

use flexds_cache::{ResourceEntry, Snapshot};
use flexds_core::{next_version, DiscoveredService, FlexdsError, FlexdsResult, ResourceKind, Rewrite};

const ROUTE_CONFIG_NAME: &str = "local_route";
const HCM_FILTER_NAME: &str = "envoy.filters.network.http_connection_manager";
const ROUTER_FILTER_NAME: &str = "envoy.filters.http.router";
const TLS_TRANSPORT_SOCKET_NAME: &str = "envoy.transport_sockets.tls";
const HTTP_PROTOCOL_OPTIONS_KEY: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";

const HCM_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const ROUTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const UPSTREAM_TLS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";
const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";

/// Build a versioned snapshot from the merged service set.
///
/// Pure aside from the process-global version counter. Returns an empty
/// snapshot (still versioned, still pushable) when no service is routable.
pub fn build_snapshot(
    services: &[DiscoveredService],
    listener_ports: &[u16],
) -> FlexdsResult<Snapshot> {
    let version = next_version();

    let mut clusters = Vec::new();
    let mut endpoints = Vec::new();
    let mut all_routes: Vec<Route> = Vec::new();

    info!(version = %version, services = services.len(), "building snapshot");

    for svc in services {
        let reachable: Vec<_> = svc
            .instances
            .iter()
            .filter(|inst| !inst.address.is_empty())
            .collect();

        if reachable.is_empty() || svc.routes.is_empty() {
            info!(service = %svc.name, "service has no reachable instances or no routes, skipping");
            continue;
        }

        debug!(service = %svc.name, instances = reachable.len(), "adding service");

        let assignment = ClusterLoadAssignment {
            cluster_name: svc.name.clone(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: reachable
                    .iter()
                    .map(|inst| LbEndpoint {
                        host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
                            address: Some(socket_address(&inst.address, u32::from(inst.port))),
                            ..Default::default()
                        })),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let cluster = build_cluster(svc, assignment.clone())?;

        endpoints.push(ResourceEntry::new(
            &svc.name,
            encode(ResourceKind::Endpoint.type_url(), &assignment)?,
        ));
        clusters.push(ResourceEntry::new(
            &svc.name,
            encode(ResourceKind::Cluster.type_url(), &cluster)?,
        ));

        for pattern in &svc.routes {
            all_routes.push(build_route(&svc.name, pattern));
        }
    }

    // No routable service at all: push an empty snapshot to drop all routing.
    if all_routes.is_empty() {
        warn!(version = %version, "no routable services, building empty snapshot");
        return Ok(Snapshot::builder().version(version).build());
    }

    let route_config = RouteConfiguration {
        name: ROUTE_CONFIG_NAME.to_string(),
        virtual_hosts: vec![VirtualHost {
            name: "default".to_string(),
            domains: vec!["*".to_string()],
            routes: all_routes,
            ..Default::default()
        }],
        ..Default::default()
    };
    let routes = vec![ResourceEntry::new(
        ROUTE_CONFIG_NAME,
        encode(ResourceKind::Route.type_url(), &route_config)?,
    )];

    let hcm_any = pack(HCM_TYPE_URL, &connection_manager())?;
    let mut listeners = Vec::with_capacity(listener_ports.len());
    for &port in listener_ports {
        let name = format!("listener_{port}");
        let listener = Listener {
            name: name.clone(),
            address: Some(socket_address("0.0.0.0", u32::from(port))),
            filter_chains: vec![FilterChain {
                filters: vec![Filter {
                    name: HCM_FILTER_NAME.to_string(),
                    config_type: Some(filter::ConfigType::TypedConfig(hcm_any.clone())),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        listeners.push(ResourceEntry::new(
            name,
            encode(ResourceKind::Listener.type_url(), &listener)?,
        ));
    }

    Ok(Snapshot::builder()
        .version(version)
        .resources(ResourceKind::Cluster, clusters)
        .resources(ResourceKind::Endpoint, endpoints)
        .resources(ResourceKind::Route, routes)
        .resources(ResourceKind::Listener, listeners)
        .build())
}

fn build_cluster(
    svc: &DiscoveredService,
    assignment: ClusterLoadAssignment,
) -> FlexdsResult<Cluster> {
    let mut cl = Cluster {
        name: svc.name.clone(),
        connect_timeout: Some(ProtoDuration {
            seconds: 2,
            nanos: 0,
        }),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::StrictDns as i32,
        )),
        lb_policy: cluster::LbPolicy::RoundRobin as i32,
        dns_lookup_family: cluster::DnsLookupFamily::V4Only as i32,
        load_assignment: Some(assignment),
        respect_dns_ttl: true,
        ..Default::default()
    };

    match svc.dns_refresh_rate {
        Some(rate) if !rate.is_zero() => {
            cl.dns_refresh_rate = Some(ProtoDuration {
                seconds: rate.as_secs() as i64,
                nanos: rate.subsec_nanos() as i32,
            });
            cl.respect_dns_ttl = false;
        }
        _ => {}
    }

    if svc.enable_http2 {
        debug!(service = %svc.name, "configuring HTTP/2 upstream");
        let options = HttpProtocolOptions {
            upstream_protocol_options: Some(
                http_protocol_options::UpstreamProtocolOptions::ExplicitHttpConfig(
                    http_protocol_options::ExplicitHttpConfig {
                        protocol_config: Some(
                            http_protocol_options::explicit_http_config::ProtocolConfig::Http2ProtocolOptions(
                                Http2ProtocolOptions::default(),
                            ),
                        ),
                    },
                ),
            ),
            ..Default::default()
        };
        cl.typed_extension_protocol_options.insert(
            HTTP_PROTOCOL_OPTIONS_KEY.to_string(),
            pack(HTTP_PROTOCOL_OPTIONS_TYPE_URL, &options)?,
        );
    }

    if svc.enable_tls {
        debug!(service = %svc.name, "configuring upstream TLS");
        let alpn_protocols = if svc.enable_http2 {
            vec!["h2".to_string(), "http/1.1".to_string()]
        } else {
            vec!["http/1.1".to_string()]
        };
        let tls_context = UpstreamTlsContext {
            common_tls_context: Some(CommonTlsContext {
                alpn_protocols,
                validation_context_type: Some(
                    common_tls_context::ValidationContextType::ValidationContext(
                        CertificateValidationContext {
                            trust_chain_verification:
                                certificate_validation_context::TrustChainVerification::AcceptUntrusted
                                    as i32,
                            ..Default::default()
                        },
                    ),
                ),
                ..Default::default()
            }),
            ..Default::default()
        };
        cl.transport_socket = Some(TransportSocket {
            name: TLS_TRANSPORT_SOCKET_NAME.to_string(),
            config_type: Some(transport_socket::ConfigType::TypedConfig(pack(
                UPSTREAM_TLS_TYPE_URL,
                &tls_context,
            )?)),
            ..Default::default()
        });
    }

    Ok(cl)
}

fn build_route(cluster_name: &str, pattern: &flexds_core::RoutePattern) -> Route {
    let mut action = RouteAction {
        cluster_specifier: Some(route_action::ClusterSpecifier::Cluster(
            cluster_name.to_string(),
        )),
        ..Default::default()
    };

    match &pattern.rewrite {
        Rewrite::Regex {
            pattern: regex,
            substitution,
        } => {
            action.regex_rewrite = Some(RegexMatchAndSubstitute {
                pattern: Some(RegexMatcher {
                    regex: regex.clone(),
                    ..Default::default()
                }),
                substitution: substitution.clone(),
            });
        }
        Rewrite::Prefix(prefix) => {
            action.prefix_rewrite = prefix.clone();
        }
        Rewrite::None => {}
    }

    let mut route_match = RouteMatch {
        path_specifier: Some(route_match::PathSpecifier::Prefix(
            pattern.path_prefix.clone(),
        )),
        ..Default::default()
    };

    if pattern.match_type.matches_header()
        && !pattern.header_name.is_empty()
        && !pattern.header_value.is_empty()
    {
        route_match.headers = vec![HeaderMatcher {
            name: pattern.header_name.clone(),
            header_match_specifier: Some(header_matcher::HeaderMatchSpecifier::StringMatch(
                StringMatcher {
                    match_pattern: Some(string_matcher::MatchPattern::Exact(
                        pattern.header_value.clone(),
                    )),
                    ..Default::default()
                },
            )),
            ..Default::default()
        }];
    }

    Route {
        r#match: Some(route_match),
        action: Some(route::Action::Route(action)),
        ..Default::default()
    }
}

fn connection_manager() -> HttpConnectionManager {
    HttpConnectionManager {
        stat_prefix: "ingress_http".to_string(),
        codec_type: http_connection_manager::CodecType::Auto as i32,
        http2_protocol_options: Some(Http2ProtocolOptions::default()),
        route_specifier: Some(http_connection_manager::RouteSpecifier::Rds(Rds {
            config_source: Some(ConfigSource {
                resource_api_version: ApiVersion::V3 as i32,
                config_source_specifier: Some(config_source::ConfigSourceSpecifier::Ads(
                    AggregatedConfigSource::default(),
                )),
                ..Default::default()
            }),
            route_config_name: ROUTE_CONFIG_NAME.to_string(),
        })),
        http_filters: vec![HttpFilter {
            name: ROUTER_FILTER_NAME.to_string(),
            config_type: Some(http_filter::ConfigType::TypedConfig(Any {
                type_url: ROUTER_TYPE_URL.to_string(),
                value: Vec::new(),
            })),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn socket_address(host: &str, port: u32) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            address: host.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(port)),
            ..Default::default()
        })),
    }
}

fn encode<M: Message>(type_url: &str, message: &M) -> FlexdsResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(message.encoded_len());
    message.encode(&mut buf).map_err(|err| FlexdsError::Encoding {
        type_url: type_url.to_string(),
        message: err.to_string(),
    })?;
    Ok(buf)
}

fn pack<M: Message>(type_url: &str, message: &M) -> FlexdsResult<Any> {
    Ok(Any {
        type_url: type_url.to_string(),
        value: encode(type_url, message)?,
    })
}
