//! Aggregated Discovery Service gRPC implementation.
//!
//! Each client stream runs in its own task: a select loop over the inbound
//! request stream and the cache watch for the client's node, driving a
//! [`StreamHandler`] and forwarding its responses. All four resource types
//! multiplex over the one stream.

use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, instrument};

use data_plane_api::envoy::service::discovery::v3::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use data_plane_api::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};

use flexds_cache::{Snapshot, SnapshotCache, Watch};

use crate::metrics::StreamGuard;
use crate::sotw::StreamHandler;

/// The ADS service registered on the gRPC server.
#[derive(Debug, Clone)]
pub struct AdsService {
    cache: Arc<SnapshotCache>,
    response_buffer: usize,
}

impl AdsService {
    /// Create the service over the shared cache.
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self::with_buffer(cache, 16)
    }

    /// Create the service with a custom per-stream response buffer.
    pub fn with_buffer(cache: Arc<SnapshotCache>, response_buffer: usize) -> Self {
        Self {
            cache,
            response_buffer,
        }
    }

    /// Wrap into the generated tonic server for `Server::add_service`.
    pub fn into_service(self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self)
    }
}

enum Event {
    Request(Option<Result<DiscoveryRequest, Status>>),
    Update(Option<Arc<Snapshot>>),
}

async fn next_update(watch: &mut Option<Watch>) -> Option<Arc<Snapshot>> {
    match watch {
        Some(watch) => watch.recv().await,
        None => std::future::pending().await,
    }
}

/// Drive one client stream to completion.
///
/// Generic over the request stream so protocol tests can feed it from a
/// channel instead of a live gRPC connection.
pub(crate) async fn run_stream<S>(
    cache: Arc<SnapshotCache>,
    mut requests: S,
    tx: mpsc::Sender<Result<DiscoveryResponse, Status>>,
) where
    S: Stream<Item = Result<DiscoveryRequest, Status>> + Unpin,
{
    let mut handler = StreamHandler::new(Arc::clone(&cache));
    let mut watch: Option<Watch> = None;
    let _guard = StreamGuard::new();

    info!(stream = %handler.context().id(), "ADS stream started");

    'stream: loop {
        let event = tokio::select! {
            request = requests.next() => Event::Request(request),
            update = next_update(&mut watch) => Event::Update(update),
        };

        match event {
            Event::Request(Some(Ok(request))) => {
                // The first identifiable request opens the cache watch. The
                // watch is created before evaluating the request so a build
                // landing in between cannot be missed.
                if let Some(key) = handler.identify(&request) {
                    watch = Some(cache.create_watch(key));
                }
                if let Some(response) = handler.handle_request(&request) {
                    if tx.send(Ok(response)).await.is_err() {
                        debug!(stream = %handler.context().id(), "client disconnected");
                        break 'stream;
                    }
                }
            }
            Event::Request(Some(Err(error))) => {
                error!(stream = %handler.context().id(), %error, "stream error");
                break 'stream;
            }
            Event::Request(None) => {
                debug!(stream = %handler.context().id(), "stream closed by client");
                break 'stream;
            }
            Event::Update(Some(_)) => {
                for response in handler.handle_snapshot_update() {
                    if tx.send(Ok(response)).await.is_err() {
                        debug!(stream = %handler.context().id(), "client disconnected");
                        break 'stream;
                    }
                }
            }
            Event::Update(None) => {
                // Watch channel closed underneath us; keep serving requests.
                watch = None;
            }
        }
    }

    if let Some(watch) = watch.take() {
        cache.cancel_watch(watch.id());
    }

    info!(
        stream = %handler.context().id(),
        duration = ?handler.context().duration(),
        requests = handler.context().request_count(),
        responses = handler.context().response_count(),
        "ADS stream ended"
    );
}

/// Response stream type for ADS.
pub type AdsResponseStream = ReceiverStream<Result<DiscoveryResponse, Status>>;

#[async_trait]
impl AggregatedDiscoveryService for AdsService {
    type StreamAggregatedResourcesStream = AdsResponseStream;

    #[instrument(skip_all, name = "ads_stream")]
    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let stream = request.into_inner();
        let (tx, rx) = mpsc::channel(self.response_buffer);

        tokio::spawn(run_stream(Arc::clone(&self.cache), stream, tx));

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type DeltaAggregatedResourcesStream = ReceiverStream<Result<DeltaDiscoveryResponse, Status>>;

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented(
            "FlexDS serves state-of-the-world ADS only",
        ))
    }
}
