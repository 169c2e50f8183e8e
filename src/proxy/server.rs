//! HTTP/1.1 front end.
//!
//! A thin listener in front of the orchestrator. Clients send plain
//! HTTP/1.1 requests naming their destination in a header (default
//! `x-egress-destination`). The server buffers the request, hands it to
//! [`ProxyOrchestrator::forward`] and writes back the upstream response, or
//! a `text/plain` error whose status comes from [`ProxyError::status`].
//!
//! # Example
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = ProxyServerBuilder::new()
//!     .listen_address("127.0.0.1:8080")
//!     .orchestrator(orchestrator)
//!     .bind(shutdown_rx)
//!     .await?;
//! server.run().await?;
//!
//! // To shutdown:
//! shutdown_tx.send(true)?;
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::ProxyError;
use super::orchestrator::ProxyOrchestrator;
use super::upstream::ProxyRequest;
use crate::config::DEFAULT_DESTINATION_HEADER;

/// Header carrying the error kind on proxy-generated failures.
pub const ERROR_KIND_HEADER: &str = "x-egress-error";

/// Default ceiling for buffered request bodies.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

/// Configuration for the proxy server.
#[derive(Clone)]
pub struct ProxyConfig {
    /// TCP address to listen on.
    pub listen_address: String,
    /// Header naming the destination.
    pub destination_header: HeaderName,
    /// Largest request body accepted.
    pub max_request_bytes: usize,
    /// Request forwarding.
    pub orchestrator: Arc<ProxyOrchestrator>,
}

/// The front-end server.
pub struct ProxyServer {
    config: ProxyConfig,
    listener: TcpListener,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listener.
    pub async fn bind(
        config: ProxyConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(&config.listen_address).await?;
        Ok(Self {
            config,
            listener,
            shutdown_rx,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the shutdown signal turns `true`.
    pub async fn run(self) -> Result<(), ProxyError> {
        info!("Proxy listening on {}", self.local_addr()?);

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            self.spawn_connection_handler(stream);
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn spawn_connection_handler(&self, stream: TcpStream) {
        let config = self.config.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, config).await {
                // Client hang-ups are routine.
                if e.is_incomplete_message() || e.is_canceled() {
                    debug!("Connection ended: {}", e);
                } else {
                    warn!("Connection error: {}", e);
                }
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, config: ProxyConfig) -> Result<(), hyper::Error> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let config = config.clone();
        async move { Ok::<_, Infallible>(proxy_request(req, &config).await) }
    });

    http1::Builder::new().serve_connection(io, service).await
}

/// Turn one client request into a forwarded exchange.
async fn proxy_request(req: Request<Incoming>, config: &ProxyConfig) -> Response<Full<Bytes>> {
    match forward(req, config).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

async fn forward(
    req: Request<Incoming>,
    config: &ProxyConfig,
) -> Result<Response<Full<Bytes>>, ProxyError> {
    let (parts, body) = req.into_parts();

    let destination_hint = parts
        .headers
        .get(&config.destination_header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProxyError::MissingDestination(config.destination_header.to_string()))?
        .to_string();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let body = Limited::new(body, config.max_request_bytes)
        .collect()
        .await
        .map_err(|e| ProxyError::BadRequest(format!("request body: {}", e)))?
        .to_bytes();

    let mut headers = parts.headers;
    headers.remove(&config.destination_header);

    let request = ProxyRequest {
        destination_hint,
        method: parts.method,
        path,
        headers,
        body,
    };

    let upstream = config.orchestrator.forward(request).await?;
    let mut response = Response::new(Full::new(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    Ok(response)
}

fn error_response(err: &ProxyError) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(format!("{}\n", err))));
    *response.status_mut() = err.status();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(
        HeaderName::from_static(ERROR_KIND_HEADER),
        HeaderValue::from_static(err.kind()),
    );
    response
}

/// Builder for ProxyServer configuration.
pub struct ProxyServerBuilder {
    listen_address: Option<String>,
    destination_header: HeaderName,
    max_request_bytes: usize,
    orchestrator: Option<Arc<ProxyOrchestrator>>,
}

impl ProxyServerBuilder {
    /// Create a new builder with defaults.
    pub fn new() -> Self {
        Self {
            listen_address: None,
            destination_header: HeaderName::from_static(DEFAULT_DESTINATION_HEADER),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            orchestrator: None,
        }
    }

    /// Set the listen address (`HOST:PORT`).
    pub fn listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = Some(address.into());
        self
    }

    /// Set the destination header.
    pub fn destination_header(mut self, header: HeaderName) -> Self {
        self.destination_header = header;
        self
    }

    /// Set the request body ceiling.
    pub fn max_request_bytes(mut self, limit: usize) -> Self {
        self.max_request_bytes = limit;
        self
    }

    /// Set the orchestrator.
    pub fn orchestrator(mut self, orchestrator: Arc<ProxyOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Finish the configuration.
    ///
    /// # Panics
    ///
    /// Panics if required fields are not set.
    pub fn build(self) -> ProxyConfig {
        ProxyConfig {
            listen_address: self.listen_address.expect("listen_address is required"),
            destination_header: self.destination_header,
            max_request_bytes: self.max_request_bytes,
            orchestrator: self.orchestrator.expect("orchestrator is required"),
        }
    }

    /// Build and bind the server.
    ///
    /// # Panics
    ///
    /// Panics if required fields are not set.
    pub async fn bind(self, shutdown_rx: watch::Receiver<bool>) -> Result<ProxyServer, ProxyError> {
        ProxyServer::bind(self.build(), shutdown_rx).await
    }
}

impl Default for ProxyServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{CertificateStore, DevPki};
    use crate::proxy::orchestrator::OrchestratorSettings;
    use crate::proxy::pool::{ConnectionPool, PoolSettings};
    use crate::proxy::router::{Router, RoutingTable};
    use crate::telemetry::AuditLogger;
    use crate::testing::{Upstream, client_identity, destination_for, soft_hsm, spawn_upstream};
    use crate::tls::{FactorySettings, TlsSessionFactory};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Running {
        addr: SocketAddr,
        _upstream: Upstream,
        _shutdown: watch::Sender<bool>,
    }

    async fn start() -> Running {
        let pki = DevPki::generate("test CA").unwrap();
        let upstream = spawn_upstream(&pki).await;
        let (keys, hsm) = soft_hsm();
        let audit = Arc::new(AuditLogger::new_null());

        let identities = Arc::new(CertificateStore::new(None, 0.2, audit.clone()).unwrap());
        identities
            .rotate(
                "default",
                client_identity(&pki, &keys, &hsm, "default", "edge-client"),
            )
            .await
            .unwrap();
        let router = Arc::new(Router::new(
            RoutingTable::new(1, [destination_for(&pki, "billing", upstream.addr)]),
            audit.clone(),
        ));
        let orchestrator = Arc::new(ProxyOrchestrator::new(
            router,
            Arc::new(ConnectionPool::new(PoolSettings::default())),
            Arc::new(TlsSessionFactory::new(FactorySettings::default())),
            identities,
            hsm,
            OrchestratorSettings::default(),
            audit,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ProxyServerBuilder::new()
            .listen_address("127.0.0.1:0")
            .orchestrator(orchestrator)
            .bind(shutdown_rx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        Running {
            addr,
            _upstream: upstream,
            _shutdown: shutdown_tx,
        }
    }

    /// One request on a fresh connection; returns the raw response text.
    async fn raw_request(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_forwarded() {
        let running = start().await;

        let response = raw_request(
            running.addr,
            "GET /v1/invoices?page=2 HTTP/1.1\r\nhost: proxy\r\nx-egress-destination: billing\r\nconnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
        assert!(response.ends_with("GET /v1/invoices cn=edge-client"), "{}", response);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_destination_is_bad_request() {
        let running = start().await;

        let response = raw_request(
            running.addr,
            "GET / HTTP/1.1\r\nhost: proxy\r\nconnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400"), "{}", response);
        assert!(response.contains("x-egress-error: missing_destination"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_destination_is_not_found() {
        let running = start().await;

        let response = raw_request(
            running.addr,
            "GET / HTTP/1.1\r\nhost: proxy\r\nx-egress-destination: ledger\r\nconnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
        assert!(response.contains("x-egress-error: unknown_destination"));
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(&ProxyError::HsmUnavailable("circuit open".to_string()));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[ERROR_KIND_HEADER], "hsm_unavailable");
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
    }

    #[test]
    #[should_panic(expected = "orchestrator is required")]
    fn test_builder_requires_orchestrator() {
        ProxyServerBuilder::new().listen_address("127.0.0.1:0").build();
    }
}
