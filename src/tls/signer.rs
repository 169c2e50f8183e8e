//! rustls signing through an HSM key handle.
//!
//! A TLS client signs exactly once per full handshake: the CertificateVerify
//! message. rustls asks for that signature synchronously, while the session
//! manager is async, so [`HsmSigner`] parks the current worker with
//! `block_in_place` and drives the HSM call on the runtime handle it was
//! created with. This needs the multi-threaded runtime.
//!
//! rustls collapses signer failures into a string, so the typed
//! [`HsmError`] is parked in a [`FailureSlot`] for the factory to pick up
//! after the handshake fails.

use std::fmt;
use std::sync::{Arc, Mutex};

use rustls::client::ResolvesClientCert;
use rustls::sign::{CertifiedKey, Signer, SigningKey};
use rustls::{SignatureAlgorithm, SignatureScheme};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

use crate::hsm::{HsmError, KeyHandle};

/// Holds the HSM error of a failed handshake signature.
pub type FailureSlot = Arc<Mutex<Option<HsmError>>>;

/// rustls signing key whose private half lives in the HSM.
pub struct HsmSigningKey {
    key: KeyHandle,
    runtime: Handle,
    failure: FailureSlot,
}

impl HsmSigningKey {
    /// Wrap `key`; HSM calls are driven on `runtime`.
    pub fn new(key: KeyHandle, runtime: Handle, failure: FailureSlot) -> Self {
        Self {
            key,
            runtime,
            failure,
        }
    }
}

impl fmt::Debug for HsmSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HsmSigningKey")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl SigningKey for HsmSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        let scheme = self.key.algorithm().scheme();
        if !offered.contains(&scheme) {
            debug!(
                "Peer did not offer {:?} for key '{}'",
                scheme,
                self.key.label()
            );
            return None;
        }
        Some(Box::new(HsmSigner {
            key: self.key.clone(),
            runtime: self.runtime.clone(),
            failure: self.failure.clone(),
        }))
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        self.key.algorithm().key_type()
    }
}

/// One handshake signature, bound to the scheme chosen for it.
pub struct HsmSigner {
    key: KeyHandle,
    runtime: Handle,
    failure: FailureSlot,
}

impl HsmSigner {
    fn record(&self, err: HsmError) -> rustls::Error {
        warn!("HSM handshake signature failed: {}", err);
        let message = err.to_string();
        *self.failure.lock().unwrap() = Some(err);
        rustls::Error::General(message)
    }
}

impl fmt::Debug for HsmSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HsmSigner")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Signer for HsmSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        if !matches!(self.runtime.runtime_flavor(), RuntimeFlavor::MultiThread) {
            return Err(rustls::Error::General(
                "HSM signing requires the multi-threaded runtime".to_string(),
            ));
        }

        let digest = self.key.algorithm().digest(message);
        let result = tokio::task::block_in_place(|| self.runtime.block_on(self.key.sign(&digest)));
        result.map_err(|e| self.record(e))
    }

    fn scheme(&self) -> SignatureScheme {
        self.key.algorithm().scheme()
    }
}

/// Client certificate resolver pinned to one identity.
///
/// The certificate and key are fixed when the handshake's config is built,
/// so a rotation during the handshake cannot change what is presented.
#[derive(Debug)]
pub struct PinnedClientCert {
    certified: Arc<CertifiedKey>,
}

impl PinnedClientCert {
    /// Present `certified` on every handshake.
    pub fn new(certified: Arc<CertifiedKey>) -> Self {
        Self { certified }
    }
}

impl ResolvesClientCert for PinnedClientCert {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.certified.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}
