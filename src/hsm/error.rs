//! Error types for HSM key operations.

use std::time::Duration;
use thiserror::Error;

use super::keystore::SigningAlgorithm;

/// Errors reported by a key-store backend.
///
/// These are the raw outcomes of a single device call. The session manager
/// folds them into [`HsmError`] and its health accounting.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// The device (or the session to it) cannot be reached.
    #[error("Key store unavailable: {0}")]
    Unavailable(String),

    /// No key exists under the given label.
    #[error("Unknown key label '{0}'")]
    UnknownKey(String),

    /// The key exists but cannot perform the requested algorithm.
    #[error("Key '{label}' does not support {algorithm:?}")]
    UnsupportedAlgorithm {
        /// Label of the key.
        label: String,
        /// Algorithm that was requested.
        algorithm: SigningAlgorithm,
    },

    /// The digest length does not match the algorithm.
    #[error("Digest for {algorithm:?} must be {expected} bytes, got {actual}")]
    DigestLength {
        /// Algorithm that was requested.
        algorithm: SigningAlgorithm,
        /// Expected digest length in bytes.
        expected: usize,
        /// Actual digest length in bytes.
        actual: usize,
    },

    /// The device reported a failure while performing the operation.
    #[error("Key store device error: {0}")]
    Device(String),
}

/// Failures surfaced by the HSM session manager.
#[derive(Debug, Error)]
pub enum HsmError {
    /// The HSM is unreachable or marked unavailable.
    #[error("HSM unavailable: {0}")]
    Unavailable(String),

    /// A device call exceeded the signing timeout.
    #[error("HSM operation timed out after {0:?}")]
    Timeout(Duration),

    /// The key handle does not refer to a usable key.
    #[error("Invalid key handle: {0}")]
    InvalidKeyHandle(String),

    /// The admission gate could not be entered within the queue ceiling.
    #[error("HSM admission queue full (waited {0:?})")]
    Backpressure(Duration),
}

impl HsmError {
    /// Whether this failure says something about the device itself.
    ///
    /// Key-handle and admission failures are caller-side conditions and do
    /// not move the health state.
    pub fn counts_against_health(&self) -> bool {
        matches!(self, HsmError::Unavailable(_) | HsmError::Timeout(_))
    }
}

impl From<KeyStoreError> for HsmError {
    fn from(err: KeyStoreError) -> Self {
        match err {
            KeyStoreError::Unavailable(msg) => HsmError::Unavailable(msg),
            KeyStoreError::Device(msg) => HsmError::Unavailable(format!("device error: {}", msg)),
            KeyStoreError::UnknownKey(_)
            | KeyStoreError::UnsupportedAlgorithm { .. }
            | KeyStoreError::DigestLength { .. } => HsmError::InvalidKeyHandle(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keystore_error_mapping() {
        let err: HsmError = KeyStoreError::UnknownKey("client-1".to_string()).into();
        assert!(matches!(err, HsmError::InvalidKeyHandle(ref m) if m.contains("client-1")));

        let err: HsmError = KeyStoreError::Device("CKR_DEVICE_ERROR".to_string()).into();
        assert!(matches!(err, HsmError::Unavailable(_)));
        assert!(err.counts_against_health());
    }

    #[test]
    fn test_backpressure_does_not_count() {
        assert!(!HsmError::Backpressure(Duration::from_millis(5)).counts_against_health());
        assert!(!HsmError::InvalidKeyHandle("x".into()).counts_against_health());
        assert!(HsmError::Timeout(Duration::from_secs(1)).counts_against_health());
    }
}
