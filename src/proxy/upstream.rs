//! HTTP/1.1 exchanges over an established mTLS transport.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use tokio::task::JoinHandle;
use tracing::debug;

use super::error::ProxyError;
use super::pool::PoolTransport;
use super::router::Destination;
use crate::identity::Identity;
use crate::tls::TlsTransport;

/// Headers that describe one hop and are never forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

/// A client request addressed to a logical destination.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// Logical destination name.
    pub destination_hint: String,
    /// HTTP method.
    pub method: Method,
    /// Origin-form target, path plus query.
    pub path: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Buffered request body.
    pub body: Bytes,
}

impl ProxyRequest {
    /// Bodyless request for `path` on `destination_hint`.
    pub fn new(destination_hint: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            destination_hint: destination_hint.into(),
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Replace the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// An upstream response, fully buffered.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    /// Upstream status.
    pub status: StatusCode,
    /// Upstream headers minus hop-by-hop ones.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

/// Outcome of one exchange.
#[derive(Debug)]
pub struct Exchange {
    /// The response to hand back.
    pub response: ProxyResponse,
    /// Whether the connection may carry another request.
    pub keep_alive: bool,
}

/// An HTTP/1.1 client connection bound to one identity version.
pub struct UpstreamConnection {
    sender: SendRequest<Full<Bytes>>,
    driver: JoinHandle<()>,
    identity: Arc<Identity>,
    destination: String,
}

impl UpstreamConnection {
    /// Run the HTTP/1.1 client handshake over `transport`.
    pub async fn establish(transport: TlsTransport) -> Result<Self, ProxyError> {
        let destination = transport.destination().to_string();
        let (stream, identity) = transport.into_parts();

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::UpstreamIo(format!("HTTP handshake: {}", e)))?;

        let name = destination.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection to '{}' ended: {}", name, e);
            }
        });

        Ok(Self {
            sender,
            driver,
            identity,
            destination,
        })
    }

    /// Identity this connection authenticated with.
    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// Destination name.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Send a request built by [`prepare_request`] and buffer the
    /// response, up to `max_body` bytes.
    pub async fn send(
        &mut self,
        outgoing: Request<Full<Bytes>>,
        max_body: usize,
    ) -> Result<Exchange, ProxyError> {
        self.sender
            .ready()
            .await
            .map_err(|e| ProxyError::UpstreamIo(e.to_string()))?;

        let response = self
            .sender
            .send_request(outgoing)
            .await
            .map_err(|e| ProxyError::UpstreamIo(e.to_string()))?;

        let (parts, body) = response.into_parts();
        let keep_alive = !wants_close(&parts.headers);
        let body = Limited::new(body, max_body)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                    ProxyError::ResponseTooLarge(max_body)
                } else {
                    ProxyError::UpstreamIo(e.to_string())
                }
            })?
            .to_bytes();

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        Ok(Exchange {
            response: ProxyResponse {
                status: parts.status,
                headers,
                body,
            },
            keep_alive,
        })
    }
}

impl PoolTransport for UpstreamConnection {
    fn is_open(&self) -> bool {
        !self.sender.is_closed() && !self.driver.is_finished()
    }

    fn is_superseded(&self) -> bool {
        self.identity.is_superseded()
    }
}

impl Drop for UpstreamConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl std::fmt::Debug for UpstreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnection")
            .field("destination", &self.destination)
            .field("identity_version", &self.identity.version())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Build the upstream form of `request` for `destination`.
///
/// Runs before a connection is borrowed, so a malformed target is a
/// [`ProxyError::BadRequest`] that never touches the pool.
pub fn prepare_request(
    request: &ProxyRequest,
    destination: &Destination,
) -> Result<Request<Full<Bytes>>, ProxyError> {
    let mut outgoing = Request::builder()
        .method(request.method.clone())
        .uri(request.path.as_str())
        .body(Full::new(request.body.clone()))
        .map_err(|e| ProxyError::BadRequest(format!("invalid request target: {}", e)))?;

    let headers = outgoing.headers_mut();
    *headers = request.headers.clone();
    strip_hop_by_hop(headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);

    let host = match &destination.server_name {
        ServerName::DnsName(name) => name.as_ref().to_string(),
        _ => destination.address.clone(),
    };
    let host = HeaderValue::from_str(&host).map_err(|e| ProxyError::UpstreamUnavailable {
        destination: destination.name.clone(),
        reason: format!("invalid host '{}': {}", host, e),
    })?;
    headers.insert(header::HOST, host);

    Ok(outgoing)
}

fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by Connection are hop-by-hop too.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}
