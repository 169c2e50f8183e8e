//! Audit event types for structured logging.
//!
//! These events are logged to syslog with the `HSM_EGRESS` tag for SIEM
//! integration and operator follow-up (rotations, key failures).

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::hsm::HsmHealth;

/// Audit events for security logging.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Proxy started serving.
    ServiceStart {
        /// Process ID.
        pid: u32,
        /// Listener address.
        listen: String,
        /// Number of routes loaded.
        routes: usize,
        /// Number of identities installed.
        identities: usize,
    },

    /// Proxy stopped.
    ServiceStop {
        /// Uptime in seconds.
        uptime_sec: u64,
    },

    /// A new identity became active.
    IdentityInstalled {
        /// Logical identity name.
        name: String,
        /// Version of the installed identity.
        version: u64,
        /// Version it replaced, if any.
        replaced: Option<u64>,
        /// Leaf certificate expiry.
        not_after: DateTime<Utc>,
    },

    /// A candidate identity failed validation and was not installed.
    IdentityRejected {
        /// Logical identity name.
        name: String,
        /// Why validation failed.
        reason: String,
    },

    /// An active identity entered its renewal window.
    RotationDue {
        /// Logical identity name.
        name: String,
        /// Version of the active identity.
        version: u64,
        /// Leaf certificate expiry.
        not_after: DateTime<Utc>,
        /// Seconds of validity left.
        remaining_sec: i64,
    },

    /// A key handle was rejected by the HSM; the identity is quarantined.
    KeyHandleInvalid {
        /// Logical identity name.
        name: String,
        /// Version of the affected identity.
        version: u64,
        /// Key label.
        label: String,
    },

    /// HSM health changed.
    HsmHealthChanged {
        /// Previous state.
        from: HsmHealth,
        /// New state.
        to: HsmHealth,
        /// What triggered the change.
        reason: String,
    },

    /// Routing table replaced.
    RoutesReloaded {
        /// New table version.
        version: u64,
        /// Number of routes in the table.
        routes: usize,
    },

    /// A forwarded request ended in a typed failure.
    RequestFailed {
        /// Request correlation ID.
        request_id: String,
        /// Destination hint supplied by the client.
        destination: String,
        /// Stable failure label.
        kind: String,
        /// Human-readable detail.
        message: String,
    },
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

/// Syslog severity an event is written at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Routine lifecycle.
    Info,
    /// Needs operator attention soon.
    Warning,
    /// An identity or the HSM stopped working.
    Error,
}

impl AuditEvent {
    /// Severity for syslog.
    pub fn severity(&self) -> Severity {
        match self {
            AuditEvent::KeyHandleInvalid { .. } => Severity::Error,
            AuditEvent::HsmHealthChanged { to, .. } => match to {
                HsmHealth::Healthy => Severity::Info,
                HsmHealth::Degraded => Severity::Warning,
                HsmHealth::Unavailable => Severity::Error,
            },
            AuditEvent::IdentityRejected { .. }
            | AuditEvent::RotationDue { .. }
            | AuditEvent::RequestFailed { .. } => Severity::Warning,
            AuditEvent::ServiceStart { .. }
            | AuditEvent::ServiceStop { .. }
            | AuditEvent::IdentityInstalled { .. }
            | AuditEvent::RoutesReloaded { .. } => Severity::Info,
        }
    }

    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_installed_serialization() {
        let event = AuditEvent::IdentityInstalled {
            name: "default".to_string(),
            version: 7,
            replaced: Some(3),
            not_after: Utc::now(),
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"identity_installed\""));
        assert!(json.contains("\"version\":7"));
        assert!(json.contains("\"replaced\":3"));
        assert!(json.contains("\"ts\""));
    }

    #[test]
    fn test_hsm_health_serialization() {
        let event = AuditEvent::HsmHealthChanged {
            from: HsmHealth::Healthy,
            to: HsmHealth::Unavailable,
            reason: "3 consecutive failures".to_string(),
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"hsm_health_changed\""));
        assert!(json.contains("\"from\":\"healthy\""));
        assert!(json.contains("\"to\":\"unavailable\""));
    }

    #[test]
    fn test_request_failed_serialization() {
        let event = AuditEvent::RequestFailed {
            request_id: "abc".to_string(),
            destination: "billing".to_string(),
            kind: "hsm_unavailable".to_string(),
            message: "circuit open".to_string(),
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"request_failed\""));
        assert!(json.contains("\"kind\":\"hsm_unavailable\""));
    }

    #[test]
    fn test_severity() {
        let down = AuditEvent::HsmHealthChanged {
            from: HsmHealth::Degraded,
            to: HsmHealth::Unavailable,
            reason: "probe failed".to_string(),
        };
        let up = AuditEvent::HsmHealthChanged {
            from: HsmHealth::Unavailable,
            to: HsmHealth::Healthy,
            reason: "probe succeeded".to_string(),
        };
        assert_eq!(down.severity(), Severity::Error);
        assert_eq!(up.severity(), Severity::Info);
        assert_eq!(
            AuditEvent::ServiceStop { uptime_sec: 1 }.severity(),
            Severity::Info
        );
    }

    #[test]
    fn test_rotation_due_serialization() {
        let event = AuditEvent::RotationDue {
            name: "default".to_string(),
            version: 1,
            not_after: Utc::now(),
            remaining_sec: 600,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"rotation_due\""));
        assert!(json.contains("\"remaining_sec\":600"));
    }
}
