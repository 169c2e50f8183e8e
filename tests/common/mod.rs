//! Fixtures shared by the integration tests.
//!
//! [`Stack::start`] runs the whole proxy in-process: configuration written
//! to a temp dir, services built from it, the HTTP front end on an
//! ephemeral port and a local mTLS upstream that echoes the client
//! certificate's common name.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use chrono::{Duration, Utc};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use rustls::server::WebPkiClientVerifier;
use rustls_pki_types::PrivateKeyDer;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use hsm_egress::app::Services;
use hsm_egress::config::{Config, IdentityConfig, RouteConfig};
use hsm_egress::hsm::SigningAlgorithm;
use hsm_egress::identity::DevPki;
use hsm_egress::proxy::ProxyServerBuilder;
use hsm_egress::telemetry::AuditLogger;

/// Host name on the upstream's certificate.
pub const UPSTREAM_HOST: &str = "upstream.internal";

/// A running upstream.
pub struct Upstream {
    pub addr: SocketAddr,
    pub handshakes: Arc<AtomicUsize>,
    _shutdown: watch::Sender<bool>,
}

impl Upstream {
    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }
}

/// Start an mTLS upstream answering `<method> <path> cn=<client CN>`.
pub async fn spawn_upstream(pki: &DevPki) -> Upstream {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let server = pki
        .issue_server(&[UPSTREAM_HOST])
        .expect("Failed to issue server certificate");
    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(pki.root_store()), provider.clone())
            .build()
            .expect("Failed to build client verifier");
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("No protocol versions")
        .with_client_cert_verifier(verifier)
        .with_single_cert(
            server.chain.clone(),
            PrivateKeyDer::Pkcs8(server.key_pkcs8_der.clone().into()),
        )
        .expect("Invalid server certificate");
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind upstream");
    let addr = listener.local_addr().expect("No local address");
    let handshakes = Arc::new(AtomicUsize::new(0));
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let counter = handshakes.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((tcp, _)) = accepted else { continue };
                    let acceptor = acceptor.clone();
                    let counter = counter.clone();
                    tokio::spawn(async move {
                        let Ok(tls) = acceptor.accept(tcp).await else { return };
                        counter.fetch_add(1, Ordering::SeqCst);
                        let cn = peer_common_name(tls.get_ref().1);
                        let service = service_fn(move |req: Request<Incoming>| {
                            let body = format!("{} {} cn={}", req.method(), req.uri().path(), cn);
                            async move { Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body)))) }
                        });
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(tls), service)
                            .await;
                    });
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    });

    Upstream {
        addr,
        handshakes,
        _shutdown: shutdown_tx,
    }
}

fn peer_common_name(conn: &rustls::ServerConnection) -> String {
    conn.peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(|der| {
            let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).ok()?;
            let cn = cert.subject().iter_common_name().next()?;
            cn.as_str().ok().map(str::to_string)
        })
        .unwrap_or_default()
}

/// Write a one-hour client certificate and its key into `dir`.
pub fn write_client(pki: &DevPki, dir: &Path, label: &str) -> IdentityConfig {
    let now = Utc::now();
    let issued = pki
        .issue_client(label, now - Duration::minutes(1), now + Duration::hours(1))
        .expect("Failed to issue client certificate");
    let chain = dir.join(format!("{}.pem", label));
    std::fs::write(&chain, &issued.chain_pem).expect("Failed to write chain");
    std::fs::write(dir.join(format!("{}.key", label)), &issued.key_pem)
        .expect("Failed to write key");
    IdentityConfig {
        chain,
        key_label: label.to_string(),
        algorithm: SigningAlgorithm::EcdsaP256Sha256,
    }
}

/// Proxy, upstream and their configuration.
pub struct Stack {
    pub dir: TempDir,
    pub pki: DevPki,
    pub upstream: Upstream,
    pub config: Config,
    pub services: Services,
    pub proxy_addr: SocketAddr,
    _shutdown: watch::Sender<bool>,
}

impl Stack {
    /// Start everything with one `billing` route and a `default` identity.
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Like [`start`](Self::start), with a hook to adjust the config.
    pub async fn start_with(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let pki = DevPki::generate("integration CA").expect("Failed to generate CA");
        let upstream = spawn_upstream(&pki).await;

        let ca = dir.path().join("ca.pem");
        std::fs::write(&ca, pki.ca_cert_pem()).expect("Failed to write CA");

        let mut config = Config::default();
        config.telemetry.syslog = Some(false);
        config.hsm.keys.insert(
            "edge-client".to_string(),
            dir.path().join("edge-client.key"),
        );
        config.identity.trust_anchors = vec![ca.clone()];
        config.identities.insert(
            "default".to_string(),
            write_client(&pki, dir.path(), "edge-client"),
        );
        config.routes.insert(
            "billing".to_string(),
            RouteConfig {
                address: upstream.addr.to_string(),
                server_name: Some(UPSTREAM_HOST.to_string()),
                trust_anchors: vec![ca],
                ..Default::default()
            },
        );
        adjust(&mut config);
        config.validate().expect("Invalid test configuration");

        let services = Services::build(&config, Arc::new(AuditLogger::new_null()))
            .await
            .expect("Failed to build services");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ProxyServerBuilder::new()
            .listen_address("127.0.0.1:0")
            .orchestrator(services.orchestrator.clone())
            .bind(shutdown_rx)
            .await
            .expect("Failed to bind proxy");
        let proxy_addr = server.local_addr().expect("No proxy address");
        tokio::spawn(server.run());

        Self {
            dir,
            pki,
            upstream,
            config,
            services,
            proxy_addr,
            _shutdown: shutdown_tx,
        }
    }

    /// `GET path` through the proxy to `destination`.
    pub async fn get(&self, destination: &str, path: &str) -> HttpReply {
        let request = format!(
            "GET {} HTTP/1.1\r\nhost: proxy\r\nx-egress-destination: {}\r\nconnection: close\r\n\r\n",
            path, destination
        );
        send_raw(self.proxy_addr, &request).await
    }
}

/// A parsed HTTP/1.1 response.
#[derive(Debug)]
pub struct HttpReply {
    pub status: u16,
    pub head: String,
    pub body: String,
}

/// Send one request on a fresh connection and read until close.
pub async fn send_raw(addr: SocketAddr, request: &str) -> HttpReply {
    let mut stream = TcpStream::connect(addr)
        .await
        .expect("Failed to connect to proxy");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("Failed to send request");
    let mut raw = String::new();
    stream
        .read_to_string(&mut raw)
        .await
        .expect("Failed to read response");

    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("Malformed status line");
    HttpReply {
        status,
        head: head.to_string(),
        body: body.to_string(),
    }
}
