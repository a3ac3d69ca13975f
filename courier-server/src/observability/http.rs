//! Operational HTTP endpoint
//!
//! Serves Prometheus metrics at `/metrics`, the manager snapshot at `/info`,
//! a sample of authenticated clients at `/clients?count=N` and a liveness
//! probe at `/health`.

use std::convert::Infallible;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use courier_utils::{CourierError, Result};

use super::metrics::GaugeSnapshot;
use crate::SharedState;

/// Samples returned by `/clients` when no count is given
pub const DEFAULT_SAMPLE_COUNT: usize = 20;

/// Bind `addr` and serve until shutdown
pub async fn run_stats_server(addr: String, state: SharedState) -> Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| CourierError::Bind {
            addr: addr.clone(),
            source,
        })?;

    info!("Stats server listening on http://{}/metrics", addr);
    serve(listener, state).await;
    Ok(())
}

/// Serve HTTP connections from `listener`
pub async fn serve(listener: TcpListener, state: SharedState) {
    let mut shutdown_rx = state.subscribe_shutdown();

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, remote_addr) = match accept_result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Stats server accept error: {}", e);
                        continue;
                    }
                };

                let io = TokioIo::new(stream);
                let state = state.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { handle_request(req, state).await }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        // Clients hanging up mid-request is routine
                        if !e.is_incomplete_message() {
                            warn!("Stats connection error from {}: {}", remote_addr, e);
                        }
                    }
                });
            }

            _ = shutdown_rx.recv() => {
                info!("Stats server shutting down");
                break;
            }
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: SharedState,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path(), req.uri().query(), &state))
}

fn route(method: &Method, path: &str, query: Option<&str>, state: &SharedState) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/metrics") => serve_metrics(state),
        (&Method::GET, "/info") => json_response(&state.manager.snapshot()),
        (&Method::GET, "/clients") => match sample_count(query) {
            Some(count) => json_response(&state.manager.list_sample(count)),
            None => text_response(StatusCode::BAD_REQUEST, "count must be a non-negative integer"),
        },
        (&Method::GET, "/health") => text_response(StatusCode::OK, "OK"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

/// `count` from the query string; absent means the default
fn sample_count(query: Option<&str>) -> Option<usize> {
    let value = query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .find_map(|pair| pair.strip_prefix("count="));

    match value {
        Some(value) => value.parse().ok(),
        None => Some(DEFAULT_SAMPLE_COUNT),
    }
}

fn serve_metrics(state: &SharedState) -> Response<Full<Bytes>> {
    let registry = state.manager.registry();
    let mut gauges = GaugeSnapshot {
        registered_users: registry.len() as u64,
        registered_clients: registry.client_count() as u64,
        ..Default::default()
    };
    gauges.collect_process_metrics();

    let body = state
        .metrics
        .to_prometheus(&state.manager.snapshot(), &gauges);
    with_content_type(
        StatusCode::OK,
        body,
        "text/plain; version=0.0.4; charset=utf-8",
    )
}

fn json_response<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => with_content_type(StatusCode::OK, body, "application/json"),
        Err(e) => {
            warn!("Failed to encode stats response: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
        }
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    with_content_type(status, body, "text/plain")
}

fn with_content_type(
    status: StatusCode,
    body: impl Into<Bytes>,
    content_type: &'static str,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
