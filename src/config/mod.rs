//! Configuration system for hsm-egress.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (`config/default.toml`)
//! 2. System config: `/etc/hsm-egress/config.toml`
//! 3. User config: `~/.config/hsm-egress/config.toml`
//! 4. Additional config file (via `--config` flag)
//!
//! # Merge Behavior
//!
//! - **Scalars** (timeouts, log_level, etc.) are **overridden**
//! - **Lists** (trust anchors) are **merged** (appended)
//! - **Maps** (`[identities.*]`, `[routes.*]`, `[hsm.keys]`) are **merged**
//!   by key (later values override)
//!
//! # Routes
//!
//! ```toml
//! [routes.billing]
//! address = "10.0.0.5:8443"
//! trust_anchors = ["/etc/hsm-egress/billing-ca.pem"]
//! identity = "default"
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    Config, DEFAULT_DESTINATION_HEADER, DEFAULT_IDENTITY, DEFAULT_LISTEN_ADDRESS, GeneralConfig,
    HsmConfig, IdentityConfig, IdentitySection, ListenerConfig, PoolConfig, ProxySection,
    RouteConfig, TelemetryConfig,
};
