//! # flexds-server
//!
//! The xDS delivery layer: an Aggregated Discovery Service gRPC server with
//! per-client version/nonce tracking, plus the admin HTTP endpoint
//! (`/metrics`, `/healthz`) and signal handling.
//!
//! ## Example
//!
//! ```rust,ignore
//! use flexds_server::XdsServer;
//! use flexds_cache::SnapshotCache;
//! use std::sync::Arc;
//!
//! let cache = Arc::new(SnapshotCache::new());
//! let (tx, rx) = tokio::sync::watch::channel(false);
//! let server = XdsServer::new(Arc::clone(&cache));
//! server.serve("0.0.0.0:18000".parse()?, rx).await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod admin;
mod ads;
mod metrics;
mod nonce;
pub mod shutdown;
mod sotw;
mod stream;


pub use ads::AdsService;
pub use sotw::StreamHandler;
pub use stream::{StreamContext, StreamId};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tonic::transport::Server;
use tracing::info;

use flexds_cache::SnapshotCache;

/// Tuning knobs for the gRPC server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP/2 keepalive ping interval.
    pub keepalive_interval: Duration,
    /// HTTP/2 keepalive ping timeout.
    pub keepalive_timeout: Duration,
    /// Per-connection concurrent stream budget. Effectively unbounded by
    /// default; every connected proxy holds one long-lived stream.
    pub max_concurrent_streams: usize,
    /// Outbound response buffer per stream.
    pub response_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(5),
            max_concurrent_streams: 1_000_000,
            response_buffer_size: 16,
        }
    }
}

/// The ADS gRPC server.
#[derive(Debug)]
pub struct XdsServer {
    cache: Arc<SnapshotCache>,
    config: ServerConfig,
}

impl XdsServer {
    /// Create a server over the shared cache with default configuration.
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self::with_config(cache, ServerConfig::default())
    }

    /// Create a server with custom configuration.
    pub fn with_config(cache: Arc<SnapshotCache>, config: ServerConfig) -> Self {
        Self { cache, config }
    }

    /// The server configuration.
    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve ADS until the shutdown channel fires, then drain open streams
    /// and return.
    pub async fn serve(
        self,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), tonic::transport::Error> {
        let ads = AdsService::with_buffer(Arc::clone(&self.cache), self.config.response_buffer_size);

        info!(%addr, "starting ADS server");
        Server::builder()
            .http2_keepalive_interval(Some(self.config.keepalive_interval))
            .http2_keepalive_timeout(Some(self.config.keepalive_timeout))
            .concurrency_limit_per_connection(self.config.max_concurrent_streams)
            .add_service(ads.into_service())
            .serve_with_shutdown(addr, async move {
                let _ = shutdown.changed().await;
                info!("shutdown requested, draining ADS streams");
            })
            .await
    }
}
