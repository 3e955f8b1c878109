//! Operator self-metrics and health probes.
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use http_body_util::Full;
use hyper::{
    Request, Response, StatusCode, body::Bytes, header::CONTENT_TYPE, server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;

/// Parse a bind address like `:8080`, `127.0.0.1:8080` or `0`, the latter
/// disabling the endpoint.
pub(crate) fn bind_address(address: &str) -> Result<Option<SocketAddr>, String> {
    let address = address.trim();
    if address == "0" {
        return Ok(None);
    }
    let address = match address.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => address.to_string(),
    };
    address
        .parse()
        .map(Some)
        .map_err(|e| format!("invalid bind address {:?}: {}", address, e))
}

/// Back the global meter provider by a Prometheus registry.
pub(crate) fn init_meter_provider() -> anyhow::Result<Registry> {
    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(provider);
    Ok(registry)
}

/// What an HTTP listener serves.
#[derive(Clone)]
pub(crate) enum Endpoint {
    /// `/metrics` in Prometheus text format.
    Metrics(Registry),
    /// `/healthz` and `/readyz`, the latter only succeeding once ready.
    Health(Arc<AtomicBool>),
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

fn respond(endpoint: &Endpoint, path: &str) -> Response<Full<Bytes>> {
    match (endpoint, path) {
        (Endpoint::Metrics(registry), "/metrics") => {
            let encoder = TextEncoder::new();
            let mut result = Vec::new();
            match encoder.encode(&registry.gather(), &mut result) {
                Ok(_) => {
                    let mut response = Response::new(Full::new(Bytes::from(result)));
                    if let Ok(value) = encoder.format_type().parse() {
                        response.headers_mut().insert(CONTENT_TYPE, value);
                    }
                    response
                }
                Err(e) => {
                    error!("{}", e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, "")
                }
            }
        }
        (Endpoint::Health(_), "/healthz") => text(StatusCode::OK, "ok"),
        (Endpoint::Health(ready), "/readyz") if ready.load(Ordering::Relaxed) => {
            text(StatusCode::OK, "ok")
        }
        (Endpoint::Health(_), "/readyz") => text(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Serve `endpoint` on `listener` until the task is dropped.
pub(crate) async fn serve(listener: TcpListener, endpoint: Endpoint) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("failed to accept connection: {}", e);
                continue;
            }
        };
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request: Request<hyper::body::Incoming>| {
                let response = respond(&endpoint, request.uri().path());
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("connection failed: {}", e);
            }
        });
    }
}

/// Bind `address` and serve `endpoint` in the background. Nothing is
/// served if the address is `0`.
pub(crate) async fn start(address: &str, endpoint: Endpoint) -> anyhow::Result<()> {
    let Some(address) = bind_address(address).map_err(anyhow::Error::msg)? else {
        return Ok(());
    };
    let listener = TcpListener::bind(address).await?;
    info!("listening on http://{}", address);
    tokio::spawn(serve(listener, endpoint));
    Ok(())
}
