//! State-of-the-World delivery state machine.
//!
//! One [`StreamHandler`] exists per open stream. It tracks, per resource
//! type, what was last sent, what the client last acknowledged, and whether
//! a response is still in flight. The rules it enforces:
//!
//! - Responses for one type are strictly serialized: a new response for a
//!   type goes out only after the previous one was ACKed or NACKed.
//! - A version the client ACKed is never retransmitted.
//! - A version the client NACKed is never retransmitted either; the client
//!   keeps its last ACKed version as applied state until a strictly newer
//!   snapshot version is built.
//! - A request whose `response_nonce` does not match the in-flight nonce is
//!   stale (e.g. raced a reconnect) and is ignored.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use data_plane_api::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use data_plane_api::google::protobuf::Any;

use flexds_cache::{ResourceSet, Snapshot, SnapshotCache};
use flexds_core::{NodeKey, ResourceKind};

use crate::metrics;
use crate::nonce::next_nonce;
use crate::stream::StreamContext;

/// Per-(stream, type) delivery state.
#[derive(Debug, Default)]
struct TypeState {
    /// Names the client subscribed to; empty means wildcard.
    resource_names: Vec<String>,
    /// Version of the response currently or last sent.
    sent_version: Option<String>,
    /// Nonce of the response currently or last sent.
    sent_nonce: Option<String>,
    /// Version the client last ACKed; its applied state.
    acked_version: Option<String>,
    /// Version the client last NACKed, kept for introspection.
    nacked_version: Option<String>,
    /// A response is in flight and unacknowledged.
    awaiting_ack: bool,
}

/// The per-stream protocol engine.
///
/// Purely synchronous; the surrounding stream task feeds it requests and
/// snapshot wakeups and forwards whatever responses it produces. That split
/// keeps the protocol laws testable without any gRPC plumbing.
#[derive(Debug)]
pub struct StreamHandler {
    cache: Arc<SnapshotCache>,
    ctx: StreamContext,
    node: Option<NodeKey>,
    states: HashMap<ResourceKind, TypeState>,
}

impl StreamHandler {
    /// Create a handler for a freshly opened stream.
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self {
            cache,
            ctx: StreamContext::new(),
            node: None,
            states: HashMap::new(),
        }
    }

    /// Stream bookkeeping (id, counters).
    #[inline]
    pub fn context(&self) -> &StreamContext {
        &self.ctx
    }

    /// The node this stream serves, once identified.
    #[inline]
    pub fn node(&self) -> Option<&NodeKey> {
        self.node.as_ref()
    }

    /// Resolve the client node from its first request and prime its cache
    /// entry from the reference snapshot if the node is unknown.
    ///
    /// Returns the key only when the node was newly identified, so the
    /// caller can open its cache watch.
    pub fn identify(&mut self, request: &DiscoveryRequest) -> Option<NodeKey> {
        if self.node.is_some() {
            return None;
        }
        let node = request.node.as_ref()?;
        if node.id.is_empty() {
            warn!(stream = %self.ctx.id(), "request carries an empty node id");
            return None;
        }

        let key = NodeKey::new(&node.id);
        if !self.cache.contains(&key) {
            if let Some(reference) = self.cache.get(&NodeKey::reference()) {
                debug!(stream = %self.ctx.id(), node = %key, "priming node from reference snapshot");
                self.cache.set(key.clone(), Snapshot::clone(&reference));
            }
        }

        self.ctx.set_node(node.id.clone());
        self.node = Some(key.clone());
        debug!(stream = %self.ctx.id(), node = %key, "node identified");
        Some(key)
    }

    /// Process one discovery request: classify it as subscription, ACK or
    /// NACK, then decide whether a response is due.
    pub fn handle_request(&mut self, request: &DiscoveryRequest) -> Option<DiscoveryResponse> {
        self.ctx.record_request();
        metrics::requests(&request.type_url).inc();

        let Some(kind) = ResourceKind::from_type_url(&request.type_url) else {
            warn!(
                stream = %self.ctx.id(),
                type_url = %request.type_url,
                "request for a resource type this server does not provide"
            );
            return None;
        };

        if self.node.is_none() {
            warn!(stream = %self.ctx.id(), "request before node identification");
            return None;
        }

        let state = self.states.entry(kind).or_default();
        state.resource_names = request.resource_names.clone();

        if request.response_nonce.is_empty() {
            // Initial subscription for this type, possibly a reconnect
            // carrying the client's current version.
            if !request.version_info.is_empty() {
                state.acked_version = Some(request.version_info.clone());
            }
        } else if state.sent_nonce.as_deref() == Some(request.response_nonce.as_str()) {
            state.awaiting_ack = false;
            if let Some(error) = &request.error_detail {
                warn!(
                    stream = %self.ctx.id(),
                    kind = %kind,
                    version = %request.version_info,
                    nonce = %request.response_nonce,
                    error = %error.message,
                    "received NACK"
                );
                metrics::nacks(kind.type_url()).inc();
                state.nacked_version = state.sent_version.clone();
                // acked_version stays: the client still applies its last
                // accepted configuration.
            } else {
                debug!(
                    stream = %self.ctx.id(),
                    kind = %kind,
                    version = %request.version_info,
                    nonce = %request.response_nonce,
                    "received ACK"
                );
                metrics::acks(kind.type_url()).inc();
                state.acked_version = Some(request.version_info.clone());
            }
        } else {
            trace!(
                stream = %self.ctx.id(),
                kind = %kind,
                nonce = %request.response_nonce,
                "stale response nonce, ignoring"
            );
            return None;
        }

        self.maybe_respond(kind)
    }

    /// Re-evaluate every subscribed type after a snapshot update for this
    /// stream's node. Returns the due responses in push-preference order.
    pub fn handle_snapshot_update(&mut self) -> Vec<DiscoveryResponse> {
        let subscribed: Vec<ResourceKind> = ResourceKind::ALL
            .into_iter()
            .filter(|kind| self.states.contains_key(kind))
            .collect();
        subscribed
            .into_iter()
            .filter_map(|kind| self.maybe_respond(kind))
            .collect()
    }

    /// Send the current snapshot state for `kind` if the client does not
    /// have it and nothing is in flight for that type.
    fn maybe_respond(&mut self, kind: ResourceKind) -> Option<DiscoveryResponse> {
        let node = self.node.as_ref()?;
        let snapshot = self.cache.get(node)?;
        let set = snapshot.resources(kind)?;
        let state = self.states.get_mut(&kind)?;

        if state.awaiting_ack {
            return None;
        }
        let version = set.version();
        if state.acked_version.as_deref() == Some(version) {
            return None;
        }
        // Covers both an unacknowledged in-flight version and a NACKed one:
        // neither is retransmitted.
        if state.sent_version.as_deref() == Some(version) {
            return None;
        }

        let resources = collect_resources(kind, set, &state.resource_names);
        let nonce = next_nonce();

        state.sent_version = Some(version.to_string());
        state.sent_nonce = Some(nonce.clone());
        state.awaiting_ack = true;

        self.ctx.record_response();
        metrics::responses(kind.type_url()).inc();
        info!(
            stream = %self.ctx.id(),
            kind = %kind,
            version = %version,
            count = resources.len(),
            "sending discovery response"
        );

        Some(DiscoveryResponse {
            version_info: version.to_string(),
            resources,
            type_url: kind.type_url().to_string(),
            nonce,
            ..Default::default()
        })
    }
}

fn collect_resources(kind: ResourceKind, set: &ResourceSet, names: &[String]) -> Vec<Any> {
    let to_any = |entry: &flexds_cache::ResourceEntry| Any {
        type_url: kind.type_url().to_string(),
        value: entry.body.clone(),
    };

    if names.is_empty() {
        set.iter().map(to_any).collect()
    } else {
        names.iter().filter_map(|name| set.get(name)).map(to_any).collect()
    }
}
