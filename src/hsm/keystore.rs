//! Key-store capability and signing algorithms.
//!
//! A key store is anything that can sign a digest with a key it holds and
//! report that key's public half. PKCS#11 tokens, network HSM clients and
//! the in-memory [`SoftKeyStore`](super::SoftKeyStore) all sit behind the
//! same [`KeyStore`] trait. Calls are synchronous: vendor bindings block,
//! so the session manager runs them on the blocking pool.

use rustls::SignatureScheme;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384};

use super::error::KeyStoreError;

/// Signature algorithms a key handle can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningAlgorithm {
    /// ECDSA over P-256 with SHA-256, DER-encoded signature.
    EcdsaP256Sha256,
    /// ECDSA over P-384 with SHA-384, DER-encoded signature.
    EcdsaP384Sha384,
    /// RSASSA-PSS with SHA-256 and MGF1-SHA-256.
    RsaPssSha256,
}

impl SigningAlgorithm {
    /// TLS signature scheme produced by this algorithm.
    pub fn scheme(self) -> SignatureScheme {
        match self {
            SigningAlgorithm::EcdsaP256Sha256 => SignatureScheme::ECDSA_NISTP256_SHA256,
            SigningAlgorithm::EcdsaP384Sha384 => SignatureScheme::ECDSA_NISTP384_SHA384,
            SigningAlgorithm::RsaPssSha256 => SignatureScheme::RSA_PSS_SHA256,
        }
    }

    /// Key family, as rustls reports it for certificate selection.
    pub fn key_type(self) -> rustls::SignatureAlgorithm {
        match self {
            SigningAlgorithm::EcdsaP256Sha256 | SigningAlgorithm::EcdsaP384Sha384 => {
                rustls::SignatureAlgorithm::ECDSA
            }
            SigningAlgorithm::RsaPssSha256 => rustls::SignatureAlgorithm::RSA,
        }
    }

    /// Hash `message` with this algorithm's digest.
    pub fn digest(self, message: &[u8]) -> Vec<u8> {
        match self {
            SigningAlgorithm::EcdsaP256Sha256 | SigningAlgorithm::RsaPssSha256 => {
                Sha256::digest(message).to_vec()
            }
            SigningAlgorithm::EcdsaP384Sha384 => Sha384::digest(message).to_vec(),
        }
    }

    /// Digest length in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            SigningAlgorithm::EcdsaP256Sha256 | SigningAlgorithm::RsaPssSha256 => 32,
            SigningAlgorithm::EcdsaP384Sha384 => 48,
        }
    }
}

/// Capability interface to a key store.
///
/// Keys are addressed by label. Implementations never hand out private key
/// material.
pub trait KeyStore: Send + Sync {
    /// Sign a precomputed digest with the key stored under `label`.
    fn sign(
        &self,
        label: &str,
        digest: &[u8],
        algorithm: SigningAlgorithm,
    ) -> Result<Vec<u8>, KeyStoreError>;

    /// Public key for `label`, as the raw contents of the certificate's
    /// `subjectPublicKey` bit string (SEC1 point for EC, PKCS#1 for RSA).
    fn public_key(&self, label: &str) -> Result<Vec<u8>, KeyStoreError>;

    /// Cheap liveness check against the device.
    fn probe(&self) -> Result<(), KeyStoreError>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str {
        "keystore"
    }
}
