//! Plain-HTTP Prometheus metrics endpoint.
//!
//! A background server started once, unconditionally, at
//! `Operator::start()`, independent of TLS and of whether controllers are
//! running. Built on the same `hyper` stack as the webhook server, minus
//! TLS.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::error::{Error, Result};
use crate::metrics::OperatorMetrics;
use crate::utils::StopSignal;

/// Serves `GET /metrics` in Prometheus text format until `stop` is
/// signalled. A bind failure is fatal, matching the webhook server's
/// contract (the supervisor treats this task's exit as fatal either way).
pub async fn run(metrics: Arc<OperatorMetrics>, port: u16, stop: Arc<StopSignal>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Unexpected(format!("failed to bind metrics server: {e}")))?;
    tracing::info!(%addr, "metrics server listening");

    loop {
        if stop.is_set() {
            break;
        }
        let accept = tokio::select! {
            result = listener.accept() => result,
            _ = tokio::time::sleep(Duration::from_millis(200)) => continue,
        };
        let (stream, remote_addr) = match accept {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "error accepting metrics connection");
                continue;
            }
        };

        let metrics = metrics.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let metrics = metrics.clone();
                async move { serve(metrics, req).await }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::warn!(error = %e, %remote_addr, "error serving metrics connection");
            }
        });
    }

    tracing::info!("metrics server stopped");
    Ok(())
}

async fn serve(
    metrics: Arc<OperatorMetrics>,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() != "/metrics" {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap());
    }
    let body = metrics.encode();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4")
        .body(Full::new(Bytes::from(body)))
        .unwrap())
}
