//! hsm-egress: outbound mTLS proxy with HSM-held client keys
//!
//! Clients hand the proxy a request tagged with a logical destination. The
//! proxy resolves the destination, opens (or reuses) a mutually
//! authenticated TLS connection to it and forwards the request. The client
//! certificate's private key never leaves the HSM: the one signature a TLS
//! client makes during the handshake is delegated to the key store.
//!
//! # Failure Model
//!
//! Every request ends with a response or one typed [`proxy::ProxyError`]
//! within the configured deadline. A slow or dead HSM trips a circuit
//! breaker instead of piling up handshakes.
//!
//! # Architecture
//!
//! - **HSM**: key-store capability, admission gate and health ([`hsm`])
//! - **Identity**: certificate chains, rotation and expiry watching ([`identity`])
//! - **TLS**: handshakes that sign through the HSM ([`tls`])
//! - **Proxy**: routing, pooling, forwarding and the HTTP front end ([`proxy`])
//! - **Config**: Hierarchical TOML configuration ([`config`])
//! - **Telemetry**: Structured syslog logging for audit trails ([`telemetry`])

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod app;
pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod hsm;
pub mod identity;
pub mod proxy;
pub mod telemetry;
pub mod tls;

#[cfg(test)]
pub(crate) mod testing;
