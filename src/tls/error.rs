//! Error types for outbound TLS sessions.

use std::time::Duration;
use thiserror::Error;

use crate::hsm::HsmError;

/// Errors produced while establishing an upstream mTLS connection.
#[derive(Debug, Error)]
pub enum TlsError {
    /// TCP connection to the upstream failed.
    #[error("Failed to connect to '{address}': {source}")]
    Connect {
        /// Upstream address.
        address: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// TCP connection did not complete in time.
    #[error("Connecting to '{address}' timed out after {timeout:?}")]
    ConnectTimeout {
        /// Upstream address.
        address: String,
        /// Network-level timeout.
        timeout: Duration,
    },

    /// The handshake failed for a reason other than server trust.
    #[error("TLS handshake with '{destination}' failed: {cause}")]
    HandshakeFailed {
        /// Destination name.
        destination: String,
        /// What went wrong.
        cause: String,
    },

    /// The handshake did not complete in time.
    #[error("TLS handshake with '{destination}' timed out after {timeout:?}")]
    HandshakeTimeout {
        /// Destination name.
        destination: String,
        /// Handshake-level timeout.
        timeout: Duration,
    },

    /// The server's certificate did not validate against the route's anchors.
    #[error("Server certificate for '{destination}' rejected: {cause}")]
    TrustValidationFailed {
        /// Destination name.
        destination: String,
        /// Verifier message.
        cause: String,
    },

    /// The HSM failed while producing the handshake signature.
    #[error("HSM signature failed during handshake: {0}")]
    Hsm(#[from] HsmError),

    /// TLS configuration could not be built.
    #[error("TLS configuration error: {0}")]
    Config(String),

    /// Reading PEM material failed.
    #[error("Failed to read PEM file {path}: {message}")]
    Pem {
        /// File being read.
        path: std::path::PathBuf,
        /// What went wrong.
        message: String,
    },
}
