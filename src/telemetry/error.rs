//! Telemetry errors.

use thiserror::Error;

/// Audit logger setup failures.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The local syslog socket could not be opened.
    #[error("Cannot open syslog socket: {reason}")]
    SyslogUnavailable {
        /// Error reported by the syslog client.
        reason: String,
    },
}
