//! Shared fixtures for unit tests.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use chrono::{Duration, Utc};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONNECTION, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use rustls::server::WebPkiClientVerifier;
use rustls_pki_types::{PrivateKeyDer, ServerName};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::hsm::{HsmSessionManager, HsmSettings, KeyHandle, SigningAlgorithm, SoftKeyStore};
use crate::identity::{DevPki, Identity};
use crate::proxy::Destination;
use crate::telemetry::AuditLogger;
use crate::tls::{HostnameVerification, TlsPolicy};

/// Software key store behind a session manager with default settings.
pub(crate) fn soft_hsm() -> (Arc<SoftKeyStore>, Arc<HsmSessionManager>) {
    soft_hsm_with(HsmSettings::default())
}

pub(crate) fn soft_hsm_with(
    settings: HsmSettings,
) -> (Arc<SoftKeyStore>, Arc<HsmSessionManager>) {
    let store = Arc::new(SoftKeyStore::new());
    let hsm = Arc::new(HsmSessionManager::new(
        store.clone(),
        settings,
        Arc::new(AuditLogger::new_null()),
    ));
    (store, hsm)
}

/// Issue a one-hour client identity from `pki` and import its key.
pub(crate) fn client_identity(
    pki: &DevPki,
    keys: &SoftKeyStore,
    hsm: &Arc<HsmSessionManager>,
    name: &str,
    label: &str,
) -> Identity {
    let now = Utc::now();
    let issued = pki
        .issue_client(label, now - Duration::minutes(1), now + Duration::hours(1))
        .unwrap();
    keys.insert_pkcs8_der(label, &issued.key_pkcs8_der).unwrap();
    let key = KeyHandle::new(label, SigningAlgorithm::EcdsaP256Sha256, hsm.clone());
    Identity::new(name, issued.chain, key).unwrap()
}

/// Destination pointing at a [`spawn_upstream`] server.
pub(crate) fn destination_for(pki: &DevPki, name: &str, addr: SocketAddr) -> Destination {
    Destination {
        name: name.to_string(),
        address: addr.to_string(),
        server_name: ServerName::try_from(UPSTREAM_HOST).unwrap(),
        tls: TlsPolicy::new(pki.root_store(), HostnameVerification::Strict),
        identity: "default".to_string(),
    }
}

/// Host name on the upstream's server certificate.
pub(crate) const UPSTREAM_HOST: &str = "upstream.internal";

/// A local mTLS HTTP/1.1 server requiring client certificates from the CA.
pub(crate) struct Upstream {
    pub addr: SocketAddr,
    /// Completed TLS handshakes.
    pub handshakes: Arc<AtomicUsize>,
    _shutdown: watch::Sender<bool>,
}

/// Start an upstream that answers `<method> <path> cn=<client CN>`.
///
/// `/close` answers with `connection: close`.
pub(crate) async fn spawn_upstream(pki: &DevPki) -> Upstream {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let server = pki.issue_server(&[UPSTREAM_HOST]).unwrap();
    let key = PrivateKeyDer::Pkcs8(server.key_pkcs8_der.clone().into());
    let client_verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(pki.root_store()), provider.clone())
            .build()
            .unwrap();
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(server.chain.clone(), key)
        .unwrap();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
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
                            let cn = cn.clone();
                            async move {
                                let mut response = Response::new(Full::new(Bytes::from(format!(
                                    "{} {} cn={}",
                                    req.method(),
                                    req.uri().path(),
                                    cn
                                ))));
                                if req.uri().path() == "/close" {
                                    response
                                        .headers_mut()
                                        .insert(CONNECTION, HeaderValue::from_static("close"));
                                }
                                Ok::<_, Infallible>(response)
                            }
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
