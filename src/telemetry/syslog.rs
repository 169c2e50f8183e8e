//! Syslog sink for audit events.
//!
//! Each event becomes one JSON line under the `HSM_EGRESS` tag. The logger
//! is built once at startup and shared as `Arc<AuditLogger>`.

use std::sync::Mutex;

use serde::Serialize;
use syslog::{Facility, Formatter3164, LoggerBackend};
use tracing::{debug, error};

use super::error::TelemetryError;
use super::events::{AuditEvent, Severity};

/// Syslog tag for all audit events.
pub const SYSLOG_TAG: &str = "HSM_EGRESS";

type Writer = syslog::Logger<LoggerBackend, Formatter3164>;

/// Audit logger writing structured JSON events to syslog.
pub struct AuditLogger {
    /// `None` for the null logger.
    writer: Option<Mutex<Writer>>,
}

/// Event plus the request phase it happened in.
#[derive(Serialize)]
struct Record<'a> {
    #[serde(flatten)]
    event: super::events::TimestampedEvent<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

impl AuditLogger {
    /// Connect to the local syslog daemon over its Unix socket.
    pub fn new() -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_AUTH,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };

        let writer = syslog::unix(formatter).map_err(|e| TelemetryError::SyslogUnavailable {
            reason: e.to_string(),
        })?;

        debug!("Connected to syslog with tag '{}'", SYSLOG_TAG);
        Ok(Self {
            writer: Some(Mutex::new(writer)),
        })
    }

    /// Logger that drops every event.
    ///
    /// Used in tests and when `telemetry.syslog = false`.
    pub fn new_null() -> Self {
        Self { writer: None }
    }

    /// Record an event.
    pub fn log(&self, event: AuditEvent) {
        self.emit(&event, None);
    }

    /// Record an event tagged with a `context` field, e.g. the phase a
    /// request failed in.
    pub fn log_with_context(&self, event: AuditEvent, context: &str) {
        self.emit(&event, Some(context));
    }

    /// Whether events are discarded.
    pub fn is_null(&self) -> bool {
        self.writer.is_none()
    }

    fn emit(&self, event: &AuditEvent, context: Option<&str>) {
        let Some(writer) = &self.writer else {
            return;
        };
        let record = Record {
            event: event.with_timestamp(),
            context,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        let mut writer = writer.lock().unwrap();
        let written = match event.severity() {
            Severity::Info => writer.info(&line),
            Severity::Warning => writer.warning(&line),
            Severity::Error => writer.err(&line),
        };
        if let Err(e) = written {
            error!("Failed to write to syslog: {}", e);
        }
        debug!("Audit: {}", line);
    }
}
