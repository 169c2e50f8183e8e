//! Error types for identity handling.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::hsm::HsmError;

/// Errors raised while loading, validating or looking up identities.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The certificate chain has no certificates.
    #[error("Identity '{0}' has an empty certificate chain")]
    EmptyChain(String),

    /// A certificate could not be decoded.
    #[error("Cannot parse certificate for identity '{name}': {message}")]
    CertificateParse {
        /// Identity name.
        name: String,
        /// Parser message.
        message: String,
    },

    /// PEM input could not be read.
    #[error("Cannot read PEM for identity '{name}': {message}")]
    Pem {
        /// Identity name.
        name: String,
        /// What went wrong.
        message: String,
    },

    /// The leaf certificate is not valid yet.
    #[error("Identity '{name}' is not valid before {not_before}")]
    NotYetValid {
        /// Identity name.
        name: String,
        /// Leaf notBefore.
        not_before: DateTime<Utc>,
    },

    /// The leaf certificate has expired.
    #[error("Identity '{name}' expired at {not_after}")]
    Expired {
        /// Identity name.
        name: String,
        /// Leaf notAfter.
        not_after: DateTime<Utc>,
    },

    /// The HSM key does not match the leaf certificate's public key.
    #[error("Key '{label}' does not match the leaf certificate of identity '{name}'")]
    KeyMismatch {
        /// Identity name.
        name: String,
        /// Key label.
        label: String,
    },

    /// The chain does not lead to a configured trust anchor.
    #[error("Identity '{name}' chain is not trusted: {reason}")]
    UntrustedChain {
        /// Identity name.
        name: String,
        /// Verifier message.
        reason: String,
    },

    /// The identity passed to `rotate` carries another name.
    #[error("Cannot install identity '{actual}' under name '{expected}'")]
    NameMismatch {
        /// Name given to `rotate`.
        expected: String,
        /// Name carried by the identity.
        actual: String,
    },

    /// No identity is installed under the name.
    #[error("No active identity named '{0}'")]
    NotFound(String),

    /// The active identity's key handle was rejected by the HSM.
    #[error("Identity '{name}' v{version} has an invalid key handle '{label}'")]
    KeyHandleInvalid {
        /// Identity name.
        name: String,
        /// Identity version.
        version: u64,
        /// Key label.
        label: String,
    },

    /// The trust anchors for identity validation are unusable.
    #[error("Invalid identity trust anchors: {0}")]
    Anchors(String),

    /// The HSM failed while checking the key.
    #[error("HSM error while validating identity: {0}")]
    Hsm(#[from] HsmError),
}

/// Errors from development PKI generation.
#[derive(Debug, Error)]
pub enum DevPkiError {
    /// Key generation failed.
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Certificate generation failed.
    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    /// No host names were given for a server certificate.
    #[error("No host names specified for server certificate")]
    NoHosts,

    /// Writing output files failed.
    #[error("Failed to write {path}: {source}")]
    Write {
        /// File being written.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}
