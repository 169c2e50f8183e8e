//! Opaque reference to an HSM-resident private key.

use std::fmt;
use std::sync::Arc;

use super::error::HsmError;
use super::keystore::SigningAlgorithm;
use super::session::HsmSessionManager;

/// A key label bound to its algorithm and the session manager that can use it.
///
/// Holds no key material. Cloning is cheap and every clone routes through
/// the same admission gate.
#[derive(Clone)]
pub struct KeyHandle {
    label: Arc<str>,
    algorithm: SigningAlgorithm,
    hsm: Arc<HsmSessionManager>,
}

impl KeyHandle {
    /// Bind `label` to `algorithm` on `hsm`.
    pub fn new(
        label: impl Into<Arc<str>>,
        algorithm: SigningAlgorithm,
        hsm: Arc<HsmSessionManager>,
    ) -> Self {
        Self {
            label: label.into(),
            algorithm,
            hsm,
        }
    }

    /// Key label inside the key store.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Algorithm this key signs with.
    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    /// Session manager serving this key.
    pub fn session_manager(&self) -> &Arc<HsmSessionManager> {
        &self.hsm
    }

    /// Sign a digest produced with [`SigningAlgorithm::digest`].
    pub async fn sign(&self, digest: &[u8]) -> Result<Vec<u8>, HsmError> {
        self.hsm.sign(&self.label, digest, self.algorithm).await
    }

    /// Public key matching this handle.
    pub async fn public_key(&self) -> Result<Vec<u8>, HsmError> {
        self.hsm.public_key(&self.label).await
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHandle")
            .field("label", &self.label)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}
