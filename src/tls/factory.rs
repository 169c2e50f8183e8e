//! Outbound mTLS connections.
//!
//! [`TlsSessionFactory::connect`] opens a TCP connection to a destination
//! and runs the TLS handshake with the identity it was handed. The
//! identity's certificate and key handle are pinned into the handshake's
//! config, so a rotation that lands mid-handshake does not affect it.
//!
//! The network connect and the handshake have separate timeouts. The HSM
//! signature inside the handshake is additionally bounded by the session
//! manager's own sign timeout and surfaces as [`TlsError::Hsm`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::ClientConfig;
use rustls::client::{ClientSessionMemoryCache, ClientSessionStore, Resumption};
use rustls::crypto::CryptoProvider;
use rustls::sign::CertifiedKey;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info};

use super::error::TlsError;
use super::signer::{FailureSlot, HsmSigningKey, PinnedClientCert};
use crate::identity::Identity;
use crate::proxy::Destination;

/// ALPN protocol offered upstream.
const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Timeouts and cache sizes for outbound sessions.
#[derive(Debug, Clone)]
pub struct FactorySettings {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// TLS handshake timeout, HSM signature included.
    pub handshake_timeout: Duration,
    /// Resumable sessions kept per destination.
    pub session_cache_size: usize,
}

impl Default for FactorySettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
            session_cache_size: 32,
        }
    }
}

/// A session cache bound to one identity version.
struct SessionCache {
    identity_version: u64,
    store: Arc<dyn ClientSessionStore>,
}

/// Builds mutually authenticated TLS connections.
pub struct TlsSessionFactory {
    provider: Arc<CryptoProvider>,
    settings: FactorySettings,
    /// Per-destination resumption caches.
    sessions: Mutex<HashMap<String, SessionCache>>,
}

impl TlsSessionFactory {
    /// Create a factory using the aws-lc-rs provider.
    pub fn new(settings: FactorySettings) -> Self {
        Self::with_provider(
            Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
            settings,
        )
    }

    /// Create a factory with an explicit crypto provider.
    pub fn with_provider(provider: Arc<CryptoProvider>, settings: FactorySettings) -> Self {
        Self {
            provider,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Settings this factory was built with.
    pub fn settings(&self) -> &FactorySettings {
        &self.settings
    }

    /// Connect to `destination` presenting `identity`.
    pub async fn connect(
        &self,
        destination: &Destination,
        identity: Arc<Identity>,
    ) -> Result<TlsTransport, TlsError> {
        let failure: FailureSlot = Arc::new(Mutex::new(None));
        let config = self.client_config(destination, &identity, failure.clone())?;
        let connector = TlsConnector::from(Arc::new(config));

        let tcp = match timeout(
            self.settings.connect_timeout,
            TcpStream::connect(&destination.address),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TlsError::Connect {
                    address: destination.address.clone(),
                    source,
                });
            }
            Err(_) => {
                return Err(TlsError::ConnectTimeout {
                    address: destination.address.clone(),
                    timeout: self.settings.connect_timeout,
                });
            }
        };
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let handshake = connector.connect(destination.server_name.clone(), tcp);
        let stream = match timeout(self.settings.handshake_timeout, handshake).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(classify_failure(&destination.name, e, &failure)),
            Err(_) => {
                if let Some(hsm) = failure.lock().unwrap().take() {
                    return Err(TlsError::Hsm(hsm));
                }
                return Err(TlsError::HandshakeTimeout {
                    destination: destination.name.clone(),
                    timeout: self.settings.handshake_timeout,
                });
            }
        };

        let resumed = matches!(
            stream.get_ref().1.handshake_kind(),
            Some(rustls::HandshakeKind::Resumed)
        );
        info!(
            destination = %destination.name,
            identity = %identity.name(),
            version = identity.version(),
            resumed,
            "Upstream TLS session established"
        );

        Ok(TlsTransport {
            stream,
            identity,
            destination: destination.name.clone(),
            resumed,
        })
    }

    /// Drop the resumption cache for `destination`.
    pub fn forget_sessions(&self, destination: &str) {
        self.sessions.lock().unwrap().remove(destination);
    }

    fn client_config(
        &self,
        destination: &Destination,
        identity: &Arc<Identity>,
        failure: FailureSlot,
    ) -> Result<ClientConfig, TlsError> {
        let verifier = destination.tls.verifier(self.provider.clone())?;
        let signing_key = Arc::new(HsmSigningKey::new(
            identity.key().clone(),
            Handle::current(),
            failure,
        ));
        let certified = Arc::new(CertifiedKey::new(identity.chain().to_vec(), signing_key));

        let mut config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_cert_resolver(Arc::new(PinnedClientCert::new(certified)));

        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
        config.resumption =
            Resumption::store(self.session_store(&destination.name, identity.version()));
        Ok(config)
    }

    /// Resumption cache for (destination, identity version).
    ///
    /// A newer identity version replaces the destination's cache, so tickets
    /// issued to a superseded certificate are never offered again.
    fn session_store(&self, destination: &str, version: u64) -> Arc<dyn ClientSessionStore> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(cache) = sessions.get(destination)
            && cache.identity_version >= version
        {
            if cache.identity_version == version {
                return cache.store.clone();
            }
            // Superseded identity: throwaway cache, the current one stays.
            return Arc::new(ClientSessionMemoryCache::new(1));
        }

        debug!(destination, version, "New TLS session cache");
        let store: Arc<dyn ClientSessionStore> = Arc::new(ClientSessionMemoryCache::new(
            self.settings.session_cache_size,
        ));
        sessions.insert(
            destination.to_string(),
            SessionCache {
                identity_version: version,
                store: store.clone(),
            },
        );
        store
    }
}

/// Map a failed handshake to the error taxonomy.
fn classify_failure(destination: &str, err: std::io::Error, failure: &FailureSlot) -> TlsError {
    if let Some(hsm) = failure.lock().unwrap().take() {
        return TlsError::Hsm(hsm);
    }

    let tls_error = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());
    match tls_error {
        Some(rustls::Error::InvalidCertificate(cause)) => TlsError::TrustValidationFailed {
            destination: destination.to_string(),
            cause: format!("{:?}", cause),
        },
        Some(other) => TlsError::HandshakeFailed {
            destination: destination.to_string(),
            cause: other.to_string(),
        },
        None => TlsError::HandshakeFailed {
            destination: destination.to_string(),
            cause: err.to_string(),
        },
    }
}

/// An established upstream TLS stream and the identity it was built with.
pub struct TlsTransport {
    stream: TlsStream<TcpStream>,
    identity: Arc<Identity>,
    destination: String,
    resumed: bool,
}

impl TlsTransport {
    /// Identity presented during the handshake.
    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// Identity version presented during the handshake.
    pub fn identity_version(&self) -> u64 {
        self.identity.version()
    }

    /// Destination name.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Whether the session was resumed without a fresh signature.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Split into the stream and the identity it pins.
    pub fn into_parts(self) -> (TlsStream<TcpStream>, Arc<Identity>) {
        (self.stream, self.identity)
    }
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("destination", &self.destination)
            .field("identity_version", &self.identity.version())
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}
