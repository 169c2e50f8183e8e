//! Upstream server verification policy.
//!
//! Each route carries a [`TlsPolicy`]: the trust anchors its server chain
//! must lead to, and whether the certificate must also match the server
//! name. Chain validation is always delegated to rustls' webpki verifier;
//! [`AnchoredServerVerifier`] only relaxes the name check when a route asks
//! for `skip_hostname`.

use std::fmt;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{CertificateError, DigitallySignedStruct, Error, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::TlsError;

/// How the server certificate's name is checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostnameVerification {
    /// The certificate must be valid for the server name.
    #[default]
    Strict,
    /// Only the chain is validated; the name is not compared.
    SkipHostname,
}

/// Server verification policy for one destination.
#[derive(Clone)]
pub struct TlsPolicy {
    anchors: Arc<RootCertStore>,
    hostname: HostnameVerification,
}

impl TlsPolicy {
    /// Policy trusting `anchors` with the given name check.
    pub fn new(anchors: RootCertStore, hostname: HostnameVerification) -> Self {
        Self {
            anchors: Arc::new(anchors),
            hostname,
        }
    }

    /// Policy sharing an already-loaded anchor set.
    pub fn shared(anchors: Arc<RootCertStore>, hostname: HostnameVerification) -> Self {
        Self { anchors, hostname }
    }

    /// Trust anchors.
    pub fn anchors(&self) -> &Arc<RootCertStore> {
        &self.anchors
    }

    /// Name-check mode.
    pub fn hostname(&self) -> HostnameVerification {
        self.hostname
    }

    /// Build the rustls verifier for this policy.
    pub fn verifier(
        &self,
        provider: Arc<CryptoProvider>,
    ) -> Result<Arc<AnchoredServerVerifier>, TlsError> {
        let inner = WebPkiServerVerifier::builder_with_provider(self.anchors.clone(), provider)
            .build()
            .map_err(|e| TlsError::Config(format!("server verifier: {}", e)))?;
        Ok(Arc::new(AnchoredServerVerifier {
            inner,
            hostname: self.hostname,
        }))
    }
}

impl fmt::Debug for TlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsPolicy")
            .field("anchors", &self.anchors.len())
            .field("hostname", &self.hostname)
            .finish()
    }
}

/// webpki server verification with an optional relaxed name check.
#[derive(Debug)]
pub struct AnchoredServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    hostname: HostnameVerification,
}

impl ServerCertVerifier for AnchoredServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            // webpki checks the chain before the name, so a name error
            // implies the chain itself was accepted.
            Err(Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) if self.hostname == HostnameVerification::SkipHostname => {
                debug!(
                    "Accepting certificate not valid for {:?} (hostname check skipped)",
                    server_name
                );
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
