//! Error types for proxy operations.
//!
//! [`ProxyError`] is the single typed outcome a failed request ends with:
//! - Routing misses (client errors)
//! - Capacity and upstream reachability
//! - TLS policy violations
//! - HSM-dependent failures, which also drive the circuit breaker
//! - Failures while forwarding, which are never retried

use std::time::Duration;

use hyper::StatusCode;
use thiserror::Error;

use super::pool::PoolError;
use super::router::RouteError;
use crate::hsm::HsmError;
use crate::identity::IdentityError;
use crate::tls::TlsError;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request carried no destination hint.
    #[error("Missing destination header '{0}'")]
    MissingDestination(String),

    /// The client request could not be read.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// No route matches the destination hint.
    #[error("Unknown destination '{0}'")]
    UnknownDestination(String),

    /// Every pooled connection to the destination stayed busy.
    #[error("Connection pool for '{0}' exhausted")]
    PoolExhausted(String),

    /// The upstream could not be reached or no connection slot freed up.
    #[error("Upstream '{destination}' unavailable: {reason}")]
    UpstreamUnavailable {
        /// Destination name or address.
        destination: String,
        /// What went wrong.
        reason: String,
    },

    /// The TLS handshake failed for a reason other than server trust.
    #[error("TLS handshake with '{destination}' failed: {cause}")]
    HandshakeFailed {
        /// Destination name.
        destination: String,
        /// What went wrong.
        cause: String,
    },

    /// The upstream certificate did not validate.
    #[error("Upstream certificate for '{destination}' rejected: {cause}")]
    TrustValidationFailed {
        /// Destination name.
        destination: String,
        /// Verifier message.
        cause: String,
    },

    /// The HSM is unavailable, or the circuit breaker is open.
    #[error("HSM unavailable: {0}")]
    HsmUnavailable(String),

    /// An HSM call exceeded its timeout.
    #[error("HSM timed out after {0:?}")]
    HsmTimeout(Duration),

    /// The HSM admission gate stayed full.
    #[error("HSM busy: no signing slot within {0:?}")]
    HsmBackpressure(Duration),

    /// The identity's key handle is unusable until it is rotated.
    #[error("Invalid key handle: {0}")]
    InvalidKeyHandle(String),

    /// No usable identity for the route.
    #[error("No usable identity: {0}")]
    IdentityUnavailable(String),

    /// The exchange with the upstream failed after sending started.
    #[error("Upstream I/O failed: {0}")]
    UpstreamIo(String),

    /// The upstream response body exceeded the configured limit.
    #[error("Upstream response exceeds {0} bytes")]
    ResponseTooLarge(usize),

    /// The request did not finish within the end-to-end deadline.
    #[error("Request deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// I/O error on the listener side.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error on the listener side.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// HTTP status returned to the client for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingDestination(_) | ProxyError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::UnknownDestination(_) => StatusCode::NOT_FOUND,
            ProxyError::PoolExhausted(_)
            | ProxyError::UpstreamUnavailable { .. }
            | ProxyError::HsmUnavailable(_)
            | ProxyError::HsmBackpressure(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::HsmTimeout(_) | ProxyError::DeadlineExceeded(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ProxyError::HandshakeFailed { .. }
            | ProxyError::TrustValidationFailed { .. }
            | ProxyError::InvalidKeyHandle(_)
            | ProxyError::IdentityUnavailable(_)
            | ProxyError::UpstreamIo(_)
            | ProxyError::ResponseTooLarge(_)
            | ProxyError::Io(_)
            | ProxyError::Http(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Stable label for logs and audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::MissingDestination(_) => "missing_destination",
            ProxyError::BadRequest(_) => "bad_request",
            ProxyError::UnknownDestination(_) => "unknown_destination",
            ProxyError::PoolExhausted(_) => "pool_exhausted",
            ProxyError::UpstreamUnavailable { .. } => "upstream_unavailable",
            ProxyError::HandshakeFailed { .. } => "handshake_failed",
            ProxyError::TrustValidationFailed { .. } => "trust_validation_failed",
            ProxyError::HsmUnavailable(_) => "hsm_unavailable",
            ProxyError::HsmTimeout(_) => "hsm_timeout",
            ProxyError::HsmBackpressure(_) => "hsm_backpressure",
            ProxyError::InvalidKeyHandle(_) => "invalid_key_handle",
            ProxyError::IdentityUnavailable(_) => "identity_unavailable",
            ProxyError::UpstreamIo(_) => "upstream_io",
            ProxyError::ResponseTooLarge(_) => "response_too_large",
            ProxyError::DeadlineExceeded(_) => "deadline_exceeded",
            ProxyError::Io(_) => "io",
            ProxyError::Http(_) => "http",
        }
    }

    /// Whether this failure comes from the HSM.
    pub fn is_hsm(&self) -> bool {
        matches!(
            self,
            ProxyError::HsmUnavailable(_)
                | ProxyError::HsmTimeout(_)
                | ProxyError::HsmBackpressure(_)
                | ProxyError::InvalidKeyHandle(_)
        )
    }
}

impl From<HsmError> for ProxyError {
    fn from(err: HsmError) -> Self {
        match err {
            HsmError::Unavailable(msg) => ProxyError::HsmUnavailable(msg),
            HsmError::Timeout(after) => ProxyError::HsmTimeout(after),
            HsmError::Backpressure(waited) => ProxyError::HsmBackpressure(waited),
            HsmError::InvalidKeyHandle(msg) => ProxyError::InvalidKeyHandle(msg),
        }
    }
}

impl From<TlsError> for ProxyError {
    fn from(err: TlsError) -> Self {
        match err {
            TlsError::Hsm(hsm) => hsm.into(),
            TlsError::TrustValidationFailed { destination, cause } => {
                ProxyError::TrustValidationFailed { destination, cause }
            }
            TlsError::HandshakeFailed { destination, cause } => {
                ProxyError::HandshakeFailed { destination, cause }
            }
            TlsError::HandshakeTimeout {
                destination,
                timeout,
            } => ProxyError::HandshakeFailed {
                destination,
                cause: format!("timed out after {:?}", timeout),
            },
            TlsError::Connect { address, source } => ProxyError::UpstreamUnavailable {
                destination: address,
                reason: source.to_string(),
            },
            TlsError::ConnectTimeout { address, timeout } => ProxyError::UpstreamUnavailable {
                destination: address,
                reason: format!("connect timed out after {:?}", timeout),
            },
            other @ (TlsError::Config(_) | TlsError::Pem { .. }) => ProxyError::HandshakeFailed {
                destination: String::new(),
                cause: other.to_string(),
            },
        }
    }
}

impl From<RouteError> for ProxyError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::UnknownDestination(hint) => ProxyError::UnknownDestination(hint),
            other => ProxyError::UpstreamUnavailable {
                destination: String::new(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<IdentityError> for ProxyError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Hsm(hsm) => hsm.into(),
            err @ IdentityError::KeyHandleInvalid { .. } => {
                ProxyError::InvalidKeyHandle(err.to_string())
            }
            other => ProxyError::IdentityUnavailable(other.to_string()),
        }
    }
}

impl From<PoolError> for ProxyError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { destination, .. } => ProxyError::PoolExhausted(destination),
        }
    }
}
