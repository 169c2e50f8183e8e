//! Configuration schema definitions.
//!
//! Every section is optional. Scalars left at zero or empty fall back to the
//! built-in defaults through the accessor methods, so a file only needs to
//! name what it changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::error::ConfigError;
use crate::hsm::{HsmSettings, SigningAlgorithm};
use crate::identity::DEFAULT_RENEWAL_FRACTION;
use crate::proxy::{OrchestratorSettings, PoolSettings};
use crate::tls::{FactorySettings, HostnameVerification};

/// Default listener address.
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:8080";

/// Default header carrying the destination hint.
pub const DEFAULT_DESTINATION_HEADER: &str = "x-egress-destination";

/// Default identity name a route presents.
pub const DEFAULT_IDENTITY: &str = "default";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Audit logging settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Front-end listener.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Key store and admission gate.
    #[serde(default)]
    pub hsm: HsmConfig,

    /// Connection pool limits.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Request forwarding timeouts.
    #[serde(default)]
    pub proxy: ProxySection,

    /// Identity validation and expiry watching.
    #[serde(default)]
    pub identity: IdentitySection,

    /// Client identities by logical name.
    #[serde(default)]
    pub identities: BTreeMap<String, IdentityConfig>,

    /// Routing table: logical destination name to upstream.
    #[serde(default)]
    pub routes: BTreeMap<String, RouteConfig>,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Scalars are overridden when set. Lists are appended. Identities and
    /// routes merge by key, the later entry replacing the earlier one whole.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.telemetry.merge(other.telemetry);
        self.listener.merge(other.listener);
        self.hsm.merge(other.hsm);
        self.pool.merge(other.pool);
        self.proxy.merge(other.proxy);
        self.identity.merge(other.identity);
        self.identities.extend(other.identities);
        self.routes.extend(other.routes);
    }

    /// Check cross-references and value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.hsm.validate()?;
        self.identity.validate()?;

        for (name, route) in &self.routes {
            if route.address.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("routes.{}.address", name),
                    message: "address is required".to_string(),
                });
            }
            if route.host().is_none() {
                return Err(ConfigError::InvalidValue {
                    field: format!("routes.{}.address", name),
                    message: format!("expected HOST:PORT, got '{}'", route.address),
                });
            }
            if route.trust_anchors.is_empty() && !route.system_roots {
                return Err(ConfigError::InvalidValue {
                    field: format!("routes.{}.trust_anchors", name),
                    message: "set trust_anchors or system_roots = true".to_string(),
                });
            }
            let identity = route.identity_name();
            if !self.identities.contains_key(identity) {
                return Err(ConfigError::InvalidValue {
                    field: format!("routes.{}.identity", name),
                    message: format!("no identity named '{}'", identity),
                });
            }
        }

        for (name, identity) in &self.identities {
            if identity.key_label.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("identities.{}.key_label", name),
                    message: "key_label is required".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub log_level: String,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// Audit logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TelemetryConfig {
    /// Send audit events to syslog. Defaults to on.
    #[serde(default)]
    pub syslog: Option<bool>,
}

impl TelemetryConfig {
    fn merge(&mut self, other: TelemetryConfig) {
        if other.syslog.is_some() {
            self.syslog = other.syslog;
        }
    }

    /// Whether audit events go to syslog.
    pub fn syslog_enabled(&self) -> bool {
        self.syslog.unwrap_or(true)
    }
}

/// Front-end listener settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ListenerConfig {
    /// Address to accept client requests on.
    #[serde(default)]
    pub address: String,

    /// Request header naming the logical destination.
    #[serde(default)]
    pub destination_header: String,
}

impl ListenerConfig {
    fn merge(&mut self, other: ListenerConfig) {
        if !other.address.is_empty() {
            self.address = other.address;
        }
        if !other.destination_header.is_empty() {
            self.destination_header = other.destination_header;
        }
    }

    /// Listen address, or the default.
    pub fn address(&self) -> &str {
        if self.address.is_empty() {
            DEFAULT_LISTEN_ADDRESS
        } else {
            &self.address
        }
    }

    /// Destination header name, or the default.
    pub fn destination_header(&self) -> &str {
        if self.destination_header.is_empty() {
            DEFAULT_DESTINATION_HEADER
        } else {
            &self.destination_header
        }
    }
}

/// Key store settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct HsmConfig {
    /// Key-store backend. Only `soft` ships with this build.
    #[serde(default)]
    pub backend: String,

    /// Maximum concurrent device operations.
    #[serde(default)]
    pub max_concurrent: u32,

    /// Longest wait for an admission slot, in milliseconds.
    #[serde(default)]
    pub queue_timeout_ms: u64,

    /// Per-operation device timeout, in milliseconds.
    #[serde(default)]
    pub sign_timeout_ms: u64,

    /// Latency above which a call counts as slow, in milliseconds.
    #[serde(default)]
    pub slow_threshold_ms: u64,

    /// Consecutive slow calls before `Degraded`.
    #[serde(default)]
    pub degraded_after: u32,

    /// Consecutive failures before `Unavailable`.
    #[serde(default)]
    pub unavailable_after: u32,

    /// Health probe interval, in seconds.
    #[serde(default)]
    pub probe_interval_secs: u64,

    /// Software keys: label to PKCS#8 PEM file.
    #[serde(default)]
    pub keys: BTreeMap<String, PathBuf>,
}

impl HsmConfig {
    fn merge(&mut self, other: HsmConfig) {
        if !other.backend.is_empty() {
            self.backend = other.backend;
        }
        if other.max_concurrent != 0 {
            self.max_concurrent = other.max_concurrent;
        }
        if other.queue_timeout_ms != 0 {
            self.queue_timeout_ms = other.queue_timeout_ms;
        }
        if other.sign_timeout_ms != 0 {
            self.sign_timeout_ms = other.sign_timeout_ms;
        }
        if other.slow_threshold_ms != 0 {
            self.slow_threshold_ms = other.slow_threshold_ms;
        }
        if other.degraded_after != 0 {
            self.degraded_after = other.degraded_after;
        }
        if other.unavailable_after != 0 {
            self.unavailable_after = other.unavailable_after;
        }
        if other.probe_interval_secs != 0 {
            self.probe_interval_secs = other.probe_interval_secs;
        }
        self.keys.extend(other.keys);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.backend() {
            "soft" => Ok(()),
            other => Err(ConfigError::InvalidValue {
                field: "hsm.backend".to_string(),
                message: format!("unsupported key-store backend '{}'", other),
            }),
        }
    }

    /// Backend name, or `soft`.
    pub fn backend(&self) -> &str {
        if self.backend.is_empty() {
            "soft"
        } else {
            &self.backend
        }
    }

    /// Session manager settings with defaults filled in.
    pub fn settings(&self) -> HsmSettings {
        let defaults = HsmSettings::default();
        HsmSettings {
            max_concurrent: nonzero(self.max_concurrent as usize, defaults.max_concurrent),
            queue_timeout: millis_or(self.queue_timeout_ms, defaults.queue_timeout),
            sign_timeout: millis_or(self.sign_timeout_ms, defaults.sign_timeout),
            slow_threshold: millis_or(self.slow_threshold_ms, defaults.slow_threshold),
            degraded_after: nonzero(self.degraded_after, defaults.degraded_after),
            unavailable_after: nonzero(self.unavailable_after, defaults.unavailable_after),
        }
    }

    /// Health probe interval.
    pub fn probe_interval(&self) -> Duration {
        secs_or(self.probe_interval_secs, Duration::from_secs(5))
    }
}

/// Connection pool settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PoolConfig {
    /// Connections per destination, borrowed plus idle.
    #[serde(default)]
    pub max_per_destination: u32,

    /// Longest wait for a connection slot, in milliseconds.
    #[serde(default)]
    pub acquire_timeout_ms: u64,

    /// Idle time before a connection is evicted, in seconds.
    #[serde(default)]
    pub idle_ttl_secs: u64,

    /// Idle reaper interval, in seconds.
    #[serde(default)]
    pub reap_interval_secs: u64,
}

impl PoolConfig {
    fn merge(&mut self, other: PoolConfig) {
        if other.max_per_destination != 0 {
            self.max_per_destination = other.max_per_destination;
        }
        if other.acquire_timeout_ms != 0 {
            self.acquire_timeout_ms = other.acquire_timeout_ms;
        }
        if other.idle_ttl_secs != 0 {
            self.idle_ttl_secs = other.idle_ttl_secs;
        }
        if other.reap_interval_secs != 0 {
            self.reap_interval_secs = other.reap_interval_secs;
        }
    }

    /// Pool settings with defaults filled in.
    pub fn settings(&self) -> PoolSettings {
        let defaults = PoolSettings::default();
        PoolSettings {
            max_per_destination: nonzero(
                self.max_per_destination as usize,
                defaults.max_per_destination,
            ),
            acquire_timeout: millis_or(self.acquire_timeout_ms, defaults.acquire_timeout),
            idle_ttl: secs_or(self.idle_ttl_secs, defaults.idle_ttl),
        }
    }

    /// Idle reaper interval.
    pub fn reap_interval(&self) -> Duration {
        secs_or(self.reap_interval_secs, Duration::from_secs(10))
    }
}

/// Forwarding timeouts and limits.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProxySection {
    /// End-to-end request deadline, in milliseconds.
    #[serde(default)]
    pub request_timeout_ms: u64,

    /// TCP connect timeout, in milliseconds.
    #[serde(default)]
    pub connect_timeout_ms: u64,

    /// TLS handshake timeout, in milliseconds.
    #[serde(default)]
    pub handshake_timeout_ms: u64,

    /// Pause before the single acquisition retry, in milliseconds.
    #[serde(default)]
    pub retry_backoff_ms: u64,

    /// Largest upstream response body accepted, in bytes.
    #[serde(default)]
    pub max_response_bytes: u64,

    /// Resumable sessions kept per destination.
    #[serde(default)]
    pub session_cache_size: u32,
}

impl ProxySection {
    fn merge(&mut self, other: ProxySection) {
        if other.request_timeout_ms != 0 {
            self.request_timeout_ms = other.request_timeout_ms;
        }
        if other.connect_timeout_ms != 0 {
            self.connect_timeout_ms = other.connect_timeout_ms;
        }
        if other.handshake_timeout_ms != 0 {
            self.handshake_timeout_ms = other.handshake_timeout_ms;
        }
        if other.retry_backoff_ms != 0 {
            self.retry_backoff_ms = other.retry_backoff_ms;
        }
        if other.max_response_bytes != 0 {
            self.max_response_bytes = other.max_response_bytes;
        }
        if other.session_cache_size != 0 {
            self.session_cache_size = other.session_cache_size;
        }
    }

    /// TLS factory settings with defaults filled in.
    pub fn factory_settings(&self) -> FactorySettings {
        let defaults = FactorySettings::default();
        FactorySettings {
            connect_timeout: millis_or(self.connect_timeout_ms, defaults.connect_timeout),
            handshake_timeout: millis_or(self.handshake_timeout_ms, defaults.handshake_timeout),
            session_cache_size: nonzero(
                self.session_cache_size as usize,
                defaults.session_cache_size,
            ),
        }
    }

    /// Orchestrator settings with defaults filled in.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let defaults = OrchestratorSettings::default();
        OrchestratorSettings {
            request_timeout: millis_or(self.request_timeout_ms, defaults.request_timeout),
            retry_backoff: millis_or(self.retry_backoff_ms, defaults.retry_backoff),
            max_response_bytes: nonzero(
                self.max_response_bytes as usize,
                defaults.max_response_bytes,
            ),
        }
    }
}

/// Identity validation settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct IdentitySection {
    /// PEM files with the CAs client chains must lead to.
    ///
    /// When empty, the chain-of-trust check is skipped.
    #[serde(default)]
    pub trust_anchors: Vec<PathBuf>,

    /// Fraction of lifetime left that triggers a renewal flag.
    #[serde(default)]
    pub renewal_fraction: Option<f64>,

    /// Expiry watcher interval, in seconds.
    #[serde(default)]
    pub watch_interval_secs: u64,
}

impl IdentitySection {
    fn merge(&mut self, other: IdentitySection) {
        self.trust_anchors.extend(other.trust_anchors);
        if other.renewal_fraction.is_some() {
            self.renewal_fraction = other.renewal_fraction;
        }
        if other.watch_interval_secs != 0 {
            self.watch_interval_secs = other.watch_interval_secs;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fraction = self.renewal_fraction();
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "identity.renewal_fraction".to_string(),
                message: format!("must be between 0 and 1, got {}", fraction),
            });
        }
        Ok(())
    }

    /// Renewal fraction, or the default.
    pub fn renewal_fraction(&self) -> f64 {
        self.renewal_fraction.unwrap_or(DEFAULT_RENEWAL_FRACTION)
    }

    /// Expiry watcher interval.
    pub fn watch_interval(&self) -> Duration {
        secs_or(self.watch_interval_secs, Duration::from_secs(60))
    }
}

/// One client identity.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct IdentityConfig {
    /// PEM file holding the leaf certificate followed by intermediates.
    pub chain: PathBuf,

    /// Label of the private key inside the key store.
    pub key_label: String,

    /// Signature algorithm of the key.
    #[serde(default = "default_algorithm")]
    pub algorithm: SigningAlgorithm,
}

fn default_algorithm() -> SigningAlgorithm {
    SigningAlgorithm::EcdsaP256Sha256
}

/// One routing-table entry.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct RouteConfig {
    /// Upstream `HOST:PORT`.
    #[serde(default)]
    pub address: String,

    /// TLS server name, if different from the address host.
    #[serde(default)]
    pub server_name: Option<String>,

    /// PEM files with the CAs the upstream chain must lead to.
    #[serde(default)]
    pub trust_anchors: Vec<PathBuf>,

    /// Also trust the platform's root certificates.
    #[serde(default)]
    pub system_roots: bool,

    /// Server name check mode.
    #[serde(default)]
    pub hostname_verification: HostnameVerification,

    /// Identity presented to this upstream.
    #[serde(default)]
    pub identity: Option<String>,
}

impl RouteConfig {
    /// Host part of `address`, without IPv6 brackets.
    pub fn host(&self) -> Option<&str> {
        let (host, port) = self.address.rsplit_once(':')?;
        port.parse::<u16>().ok()?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        (!host.is_empty()).then_some(host)
    }

    /// Name sent as SNI and checked against the certificate.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref().or_else(|| self.host())
    }

    /// Identity name, or `default`.
    pub fn identity_name(&self) -> &str {
        self.identity.as_deref().unwrap_or(DEFAULT_IDENTITY)
    }
}

fn nonzero<T: PartialEq + Default>(value: T, default: T) -> T {
    if value == T::default() { default } else { value }
}

fn millis_or(ms: u64, default: Duration) -> Duration {
    if ms == 0 {
        default
    } else {
        Duration::from_millis(ms)
    }
}

fn secs_or(secs: u64, default: Duration) -> Duration {
    if secs == 0 {
        default
    } else {
        Duration::from_secs(secs)
    }
}
