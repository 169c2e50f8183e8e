//! Telemetry and audit logging for hsm-egress.
//!
//! This module provides structured logging to syslog with the `HSM_EGRESS` tag.
//! Identity lifecycle, HSM health and request failures are logged for SIEM
//! integration and operator follow-up.
//!
//! # Architecture
//!
//! - **Audit logging** (syslog): security events as JSON lines
//! - **Diagnostic logging** (tracing): development logs go to stderr via `tracing`
//! - These are completely separate concerns
//!
//! # Usage
//!
//! ```ignore
//! use hsm_egress::telemetry::{AuditEvent, AuditLogger};
//!
//! let audit = Arc::new(AuditLogger::new()?);
//! audit.log(AuditEvent::RoutesReloaded { version: 2, routes: 5 });
//! ```
//!
//! # Event Format
//!
//! Events are logged as JSON with an ISO8601 timestamp, at the syslog
//! severity given by [`AuditEvent::severity`]:
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"rotation_due","name":"default","version":4,"not_after":"2026-01-08T00:00:00Z","remaining_sec":3600}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::{AuditEvent, Severity, TimestampedEvent};
pub use syslog::{AuditLogger, SYSLOG_TAG};
