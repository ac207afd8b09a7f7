//! Admin HTTP endpoint: Prometheus scrape target and liveness probe.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tokio::sync::watch;
use tracing::{info, warn};

/// Serve `/metrics` and `/healthz` until the shutdown channel fires.
pub async fn serve(
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, Infallible>(service_fn(|request| async move {
            Ok::<_, Infallible>(handle_request(request))
        }))
    });

    info!(%addr, "starting admin endpoint");
    Server::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

fn handle_request(request: Request<Body>) -> Response<Body> {
    match (request.method(), request.uri().path()) {
        (&Method::GET, "/metrics") => collect_metrics(),
        (&Method::GET, "/healthz") => Response::new("ok".into()),
        _ => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}

fn collect_metrics() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    let mut buffer = vec![];
    let encoder = prometheus::TextEncoder::new();
    let body = prometheus::Encoder::encode(&encoder, &prometheus::gather(), &mut buffer)
        .map_err(|error| warn!(%error, "failed to encode metrics"))
        .and_then(|_| {
            String::from_utf8(buffer)
                .map(Body::from)
                .map_err(|error| warn!(%error, "metrics are not valid utf8"))
        });

    match body {
        Ok(body) => {
            *response.body_mut() = body;
        }
        Err(()) => {
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        }
    }

    response
}
