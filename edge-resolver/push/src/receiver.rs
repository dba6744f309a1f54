use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc};

use edge_resolver_core::{EventKind, ServiceTableUpdate};
use edge_resolver_index::ServiceTable;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, StatusCode,
};
use tracing::{info, instrument, warn};

use crate::{metrics::PushMetrics, ACK_HEADER, ACK_VALUE};

/// Binds the push endpoint and returns the bound address together with the
/// serve future. The server drains when `shutdown` fires.
pub fn bind(
    addr: &SocketAddr,
    table: Arc<ServiceTable>,
    metrics: Arc<PushMetrics>,
    shutdown: drain::Watch,
) -> Result<(SocketAddr, impl Future<Output = Result<(), hyper::Error>>), hyper::Error> {
    let make = make_service_fn(move |_conn| {
        let table = table.clone();
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle(req, table.clone(), metrics.clone())
            }))
        }
    });

    let server = hyper::server::Server::try_bind(addr)?.serve(make);
    let local_addr = server.local_addr();
    let serve = server.with_graceful_shutdown(async move {
        let _ = shutdown.signaled().await;
    });
    Ok((local_addr, serve))
}

/// Binds and serves the push endpoint until shutdown.
#[instrument(name = "push", skip_all, fields(port = %addr.port()))]
pub async fn serve(
    addr: SocketAddr,
    table: Arc<ServiceTable>,
    metrics: Arc<PushMetrics>,
    shutdown: drain::Watch,
) -> Result<(), hyper::Error> {
    let (local_addr, serve) = bind(&addr, table, metrics, shutdown)?;
    info!(addr = %local_addr, "push receiver listening");
    serve.await
}

async fn handle(
    req: Request<Body>,
    table: Arc<ServiceTable>,
    metrics: Arc<PushMetrics>,
) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::POST {
        return Ok(empty_response(StatusCode::METHOD_NOT_ALLOWED));
    }

    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(error) => {
            warn!(%error, "failed to read push update body");
            metrics.update_rejected();
            return Ok(empty_response(StatusCode::INTERNAL_SERVER_ERROR));
        }
    };

    let update = match serde_json::from_slice::<ServiceTableUpdate>(&body) {
        Ok(update) => update,
        Err(error) => {
            warn!(%error, "malformed push update");
            metrics.update_rejected();
            return Ok(empty_response(StatusCode::BAD_REQUEST));
        }
    };

    // Updates are idempotent, so replays and reordering are harmless.
    match update.event.kind {
        EventKind::Add => table.add(update.meta, &update.event.service),
        EventKind::Delete => table.remove(&update.meta, &update.event.service),
    }
    tracing::debug!(
        peer = %update.meta,
        event = ?update.event,
        services = table.len(),
        "applied push update"
    );
    metrics.update_applied();

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(ACK_HEADER, ACK_VALUE)
        .body(Body::empty())
        .unwrap())
}

fn empty_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::default())
        .unwrap()
}
