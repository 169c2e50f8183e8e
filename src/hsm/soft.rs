//! In-memory software key store.
//!
//! Holds ECDSA P-256 keys by label and implements [`KeyStore`] with
//! prehashed signing, so it behaves like a token that receives only the
//! digest. Used for development deployments and tests. A fault switch and
//! an artificial latency let tests drive the session manager's health
//! transitions.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::DecodePrivateKey;
use rustls_pki_types::PrivateKeyDer;
use tracing::debug;

use super::error::KeyStoreError;
use super::keystore::{KeyStore, SigningAlgorithm};

/// Software key store backed by process memory.
pub struct SoftKeyStore {
    keys: RwLock<HashMap<String, SigningKey>>,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl SoftKeyStore {
    /// Create an empty key store.
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Import a PKCS#8 DER-encoded P-256 private key under `label`.
    pub fn insert_pkcs8_der(&self, label: &str, der: &[u8]) -> Result<(), KeyStoreError> {
        let key = SigningKey::from_pkcs8_der(der).map_err(|e| {
            KeyStoreError::Device(format!("cannot import key '{}': {}", label, e))
        })?;
        self.keys.write().unwrap().insert(label.to_string(), key);
        debug!("Imported software key '{}'", label);
        Ok(())
    }

    /// Import a PEM private key file under `label`.
    pub fn load_pem_file(&self, label: &str, path: &Path) -> Result<(), KeyStoreError> {
        let pem = fs::read(path).map_err(|e| {
            KeyStoreError::Device(format!("cannot read key file {:?}: {}", path, e))
        })?;
        let key = rustls_pemfile::private_key(&mut pem.as_slice())
            .map_err(|e| KeyStoreError::Device(format!("invalid PEM in {:?}: {}", path, e)))?
            .ok_or_else(|| KeyStoreError::Device(format!("no private key in {:?}", path)))?;

        match key {
            PrivateKeyDer::Pkcs8(der) => self.insert_pkcs8_der(label, der.secret_pkcs8_der()),
            _ => Err(KeyStoreError::Device(format!(
                "key in {:?} is not PKCS#8",
                path
            ))),
        }
    }

    /// Generate a fresh P-256 key under `label` and return its PKCS#8 DER.
    pub fn generate(&self, label: &str) -> Result<Vec<u8>, KeyStoreError> {
        let pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| KeyStoreError::Device(format!("key generation failed: {}", e)))?;
        let der = pair.serialize_der();
        self.insert_pkcs8_der(label, &der)?;
        Ok(der)
    }

    /// Remove the key stored under `label`.
    pub fn remove(&self, label: &str) -> bool {
        self.keys.write().unwrap().remove(label).is_some()
    }

    /// Simulate the device going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Add an artificial delay to every device call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.keys.read().unwrap().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn device_call(&self) -> Result<(), KeyStoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            std::thread::sleep(Duration::from_millis(latency));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(KeyStoreError::Unavailable(
                "software key store switched off".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SoftKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for SoftKeyStore {
    fn sign(
        &self,
        label: &str,
        digest: &[u8],
        algorithm: SigningAlgorithm,
    ) -> Result<Vec<u8>, KeyStoreError> {
        self.device_call()?;

        if algorithm != SigningAlgorithm::EcdsaP256Sha256 {
            return Err(KeyStoreError::UnsupportedAlgorithm {
                label: label.to_string(),
                algorithm,
            });
        }
        if digest.len() != algorithm.digest_len() {
            return Err(KeyStoreError::DigestLength {
                algorithm,
                expected: algorithm.digest_len(),
                actual: digest.len(),
            });
        }

        let keys = self.keys.read().unwrap();
        let key = keys
            .get(label)
            .ok_or_else(|| KeyStoreError::UnknownKey(label.to_string()))?;
        let signature: Signature = key
            .sign_prehash(digest)
            .map_err(|e| KeyStoreError::Device(format!("signing failed: {}", e)))?;

        Ok(signature.to_der().as_bytes().to_vec())
    }

    fn public_key(&self, label: &str) -> Result<Vec<u8>, KeyStoreError> {
        self.device_call()?;

        let keys = self.keys.read().unwrap();
        let key = keys
            .get(label)
            .ok_or_else(|| KeyStoreError::UnknownKey(label.to_string()))?;
        Ok(key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec())
    }

    fn probe(&self) -> Result<(), KeyStoreError> {
        self.device_call()
    }

    fn backend(&self) -> &'static str {
        "soft"
    }
}
