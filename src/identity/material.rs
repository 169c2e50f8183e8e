//! Identity: a certificate chain paired with an HSM key handle.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rustls_pki_types::CertificateDer;
use x509_parser::prelude::*;

use super::error::IdentityError;
use crate::hsm::KeyHandle;

/// Process-wide source of identity versions. Versions only grow.
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// A client identity the proxy can present in a TLS handshake.
///
/// The leaf certificate is parsed once at construction; validity bounds and
/// the public key are cached. The key itself stays behind the [`KeyHandle`].
pub struct Identity {
    name: String,
    version: u64,
    chain: Vec<CertificateDer<'static>>,
    key: KeyHandle,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    leaf_public_key: Vec<u8>,
    subject: String,
    key_invalid: AtomicBool,
    superseded: AtomicBool,
}

impl Identity {
    /// Build an identity from a DER chain (leaf first) and a key handle.
    ///
    /// Only decodes the leaf. Validation against the clock, the HSM and the
    /// trust anchors happens when the identity is installed.
    pub fn new(
        name: impl Into<String>,
        chain: Vec<CertificateDer<'static>>,
        key: KeyHandle,
    ) -> Result<Self, IdentityError> {
        let name = name.into();
        let Some(leaf) = chain.first() else {
            return Err(IdentityError::EmptyChain(name));
        };
        let leaf = LeafInfo::parse(&name, leaf.as_ref())?;

        Ok(Self {
            version: NEXT_VERSION.fetch_add(1, Ordering::Relaxed),
            name,
            chain,
            key,
            not_before: leaf.not_before,
            not_after: leaf.not_after,
            leaf_public_key: leaf.public_key,
            subject: leaf.subject,
            key_invalid: AtomicBool::new(false),
            superseded: AtomicBool::new(false),
        })
    }

    /// Build an identity from PEM-encoded certificates (leaf first).
    pub fn from_pem(
        name: impl Into<String>,
        pem: &[u8],
        key: KeyHandle,
    ) -> Result<Self, IdentityError> {
        let name = name.into();
        let chain = rustls_pemfile::certs(&mut &pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| IdentityError::Pem {
                name: name.clone(),
                message: e.to_string(),
            })?;
        Self::new(name, chain, key)
    }

    /// Build an identity from a PEM chain file.
    pub fn from_pem_file(
        name: impl Into<String>,
        path: &Path,
        key: KeyHandle,
    ) -> Result<Self, IdentityError> {
        let name = name.into();
        let pem = std::fs::read(path).map_err(|e| IdentityError::Pem {
            name: name.clone(),
            message: format!("{:?}: {}", path, e),
        })?;
        Self::from_pem(name, &pem, key)
    }

    /// Logical identity name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version assigned when this identity was built.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Certificate chain, leaf first.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Key handle for the leaf's private key.
    pub fn key(&self) -> &KeyHandle {
        &self.key
    }

    /// Leaf notBefore.
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// Leaf notAfter.
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Leaf subject, for logs.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Raw `subjectPublicKey` bytes of the leaf.
    pub fn leaf_public_key(&self) -> &[u8] {
        &self.leaf_public_key
    }

    /// Total validity period of the leaf.
    pub fn lifetime(&self) -> chrono::Duration {
        self.not_after - self.not_before
    }

    /// Validity left at `now` (negative once expired).
    pub fn remaining_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.not_after - now
    }

    /// Whether `now` falls inside the leaf's validity window.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Whether the remaining validity is at most `fraction` of the lifetime.
    pub fn needs_renewal_at(&self, now: DateTime<Utc>, fraction: f64) -> bool {
        let lifetime = self.lifetime().num_seconds() as f64;
        let remaining = self.remaining_at(now).num_seconds() as f64;
        remaining <= lifetime * fraction
    }

    /// Whether the HSM has rejected this identity's key handle.
    pub fn is_key_invalid(&self) -> bool {
        self.key_invalid.load(Ordering::SeqCst)
    }

    /// Mark the key handle unusable. Returns `true` on the first call.
    pub(crate) fn mark_key_invalid(&self) -> bool {
        !self.key_invalid.swap(true, Ordering::SeqCst)
    }

    /// Whether a newer identity has replaced this one in the store.
    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_superseded(&self) {
        self.superseded.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("subject", &self.subject)
            .field("chain_len", &self.chain.len())
            .field("key", &self.key)
            .field("not_after", &self.not_after)
            .finish()
    }
}

struct LeafInfo {
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    public_key: Vec<u8>,
    subject: String,
}

impl LeafInfo {
    fn parse(name: &str, der: &[u8]) -> Result<Self, IdentityError> {
        let parse_err = |message: String| IdentityError::CertificateParse {
            name: name.to_string(),
            message,
        };

        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| parse_err(format!("X.509 parse error: {}", e)))?;

        let validity = cert.validity();
        let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
            .ok_or_else(|| parse_err("notBefore out of range".to_string()))?;
        let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
            .ok_or_else(|| parse_err("notAfter out of range".to_string()))?;

        Ok(Self {
            not_before,
            not_after,
            public_key: cert.public_key().subject_public_key.as_ref().to_vec(),
            subject: cert.subject().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DevPki;
    use crate::testing::soft_hsm;
    use chrono::Duration;

    #[tokio::test]
    async fn test_identity_from_dev_pki() {
        let pki = DevPki::generate("test CA").unwrap();
        let now = Utc::now();
        let issued = pki
            .issue_client("svc-a", now - Duration::minutes(5), now + Duration::hours(1))
            .unwrap();

        let (store, hsm) = soft_hsm();
        store.insert_pkcs8_der("svc-a", &issued.key_pkcs8_der).unwrap();
        let key = KeyHandle::new(
            "svc-a",
            crate::hsm::SigningAlgorithm::EcdsaP256Sha256,
            hsm,
        );

        let identity = Identity::from_pem("default", issued.chain_pem.as_bytes(), key).unwrap();
        assert_eq!(identity.name(), "default");
        assert_eq!(identity.chain().len(), 2);
        assert!(identity.subject().contains("svc-a"));
        assert!(identity.is_valid_at(now));
        assert_eq!(identity.leaf_public_key(), identity.key().public_key().await.unwrap());
    }

    #[test]
    fn test_versions_increase() {
        let pki = DevPki::generate("test CA").unwrap();
        let now = Utc::now();
        let issued = pki
            .issue_client("svc-a", now, now + Duration::hours(1))
            .unwrap();
        let (_store, hsm) = soft_hsm();
        let key = KeyHandle::new("k", crate::hsm::SigningAlgorithm::EcdsaP256Sha256, hsm);

        let first = Identity::new("a", issued.chain.clone(), key.clone()).unwrap();
        let second = Identity::new("a", issued.chain.clone(), key).unwrap();
        assert!(second.version() > first.version());
    }

    #[test]
    fn test_empty_chain_rejected() {
        let (_store, hsm) = soft_hsm();
        let key = KeyHandle::new("k", crate::hsm::SigningAlgorithm::EcdsaP256Sha256, hsm);
        let err = Identity::new("a", Vec::new(), key).unwrap_err();
        assert!(matches!(err, IdentityError::EmptyChain(_)));
    }

    #[test]
    fn test_garbage_certificate_rejected() {
        let (_store, hsm) = soft_hsm();
        let key = KeyHandle::new("k", crate::hsm::SigningAlgorithm::EcdsaP256Sha256, hsm);
        let err = Identity::new("a", vec![CertificateDer::from(vec![1u8, 2, 3])], key).unwrap_err();
        assert!(matches!(err, IdentityError::CertificateParse { .. }));
    }

    #[test]
    fn test_renewal_window() {
        let pki = DevPki::generate("test CA").unwrap();
        let start = Utc::now();
        let issued = pki
            .issue_client("svc-a", start, start + Duration::hours(1))
            .unwrap();
        let (_store, hsm) = soft_hsm();
        let key = KeyHandle::new("k", crate::hsm::SigningAlgorithm::EcdsaP256Sha256, hsm);
        let identity = Identity::new("a", issued.chain, key).unwrap();

        // 20% of one hour is 12 minutes.
        assert!(!identity.needs_renewal_at(identity.not_before() + Duration::minutes(47), 0.2));
        assert!(identity.needs_renewal_at(identity.not_before() + Duration::minutes(49), 0.2));
    }

    #[test]
    fn test_mark_key_invalid_once() {
        let pki = DevPki::generate("test CA").unwrap();
        let now = Utc::now();
        let issued = pki.issue_client("svc", now, now + Duration::hours(1)).unwrap();
        let (_store, hsm) = soft_hsm();
        let key = KeyHandle::new("k", crate::hsm::SigningAlgorithm::EcdsaP256Sha256, hsm);
        let identity = Identity::new("a", issued.chain, key).unwrap();

        assert!(!identity.is_key_invalid());
        assert!(identity.mark_key_invalid());
        assert!(!identity.mark_key_invalid());
        assert!(identity.is_key_invalid());
    }
}
