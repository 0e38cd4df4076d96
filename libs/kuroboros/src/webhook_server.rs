//! TLS admission webhook server.
//!
//! A single `tokio::spawn`ed task serving `hyper` over `rustls`,
//! same-process rather than a separate worker process, since the
//! surrounding supervisor already treats this task's death as fatal
//! regardless of how it's isolated.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};
use crate::utils::StopSignal;
use crate::webhook::WebhookEndpoint;

pub struct WebhookServer {
    routes: HashMap<String, Arc<dyn WebhookEndpoint>>,
    addr: SocketAddr,
    cert_pem: String,
    key_pem: String,
}

impl WebhookServer {
    pub fn new(port: u16, cert_pem: String, key_pem: String) -> Self {
        Self {
            routes: HashMap::new(),
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            cert_pem,
            key_pem,
        }
    }

    pub fn register(&mut self, path: String, endpoint: Arc<dyn WebhookEndpoint>) {
        tracing::info!(path = %path, "registering webhook endpoint");
        self.routes.insert(path, endpoint);
    }

    fn tls_acceptor(&self) -> Result<TlsAcceptor> {
        let certs: Vec<CertificateDer<'static>> = certs(&mut self.cert_pem.as_bytes())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Tls(format!("invalid certificate: {e}")))?;
        let mut keys: Vec<PrivateKeyDer<'static>> = pkcs8_private_keys(&mut self.key_pem.as_bytes())
            .map(|k| k.map(PrivateKeyDer::from))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Tls(format!("invalid private key: {e}")))?;
        let key = keys
            .pop()
            .ok_or_else(|| Error::Tls("no private key found".into()))?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Tls(format!("invalid TLS config: {e}")))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Runs until `stop` is signalled. A bind or TLS-config failure is
    /// fatal and returned to the caller (the supervisor treats this task's
    /// exit, error or not, as fatal to the whole operator).
    pub async fn run(self, stop: Arc<StopSignal>) -> Result<()> {
        let acceptor = self.tls_acceptor()?;
        let routes = Arc::new(self.routes);
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| Error::Unexpected(format!("failed to bind webhook server: {e}")))?;
        tracing::info!(addr = %self.addr, "webhook server listening");

        loop {
            if stop.is_set() {
                break;
            }
            let accept = tokio::select! {
                result = listener.accept() => result,
                _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => continue,
            };
            let (stream, remote_addr) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "error accepting webhook connection");
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let routes = routes.clone();
            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(error = %e, %remote_addr, "TLS handshake failed");
                        return;
                    }
                };
                let io = TokioIo::new(tls_stream);
                let service = service_fn(move |req| {
                    let routes = routes.clone();
                    async move { serve(routes, remote_addr, req).await }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::warn!(error = %e, %remote_addr, "error serving webhook connection");
                }
            });
        }

        tracing::info!("webhook server stopped");
        Ok(())
    }
}

async fn serve(
    routes: Arc<HashMap<String, Arc<dyn WebhookEndpoint>>>,
    remote_addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let Some(endpoint) = routes.get(&path) else {
        tracing::info!(%method, %path, %remote_addr, status = 404, "no webhook registered for path");
        return Ok(not_found());
    };

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!(%method, %path, error = %e, "failed to read request body");
            return Ok(bad_request());
        }
    };

    let parsed: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(%method, %path, error = %e, "malformed admission review body");
            return Ok(bad_request());
        }
    };

    let (status, response_body) = endpoint.handle(parsed).await;
    let encoded = serde_json::to_vec(&response_body).unwrap_or_default();
    tracing::info!(%method, %path, %remote_addr, status, "handled admission review");

    Ok(Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(encoded)))
        .unwrap())
}

fn not_found() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn bad_request() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(Full::new(Bytes::new()))
        .unwrap()
}
