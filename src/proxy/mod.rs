//! Request routing, connection pooling and forwarding.
//!
//! This module provides:
//! - [`Router`]: versioned, hot-swappable destination table
//! - [`ConnectionPool`]: bounded per-destination pool of upstream connections
//! - [`ProxyOrchestrator`]: one request from destination hint to response,
//!   with the HSM circuit breaker and end-to-end deadline
//! - [`ProxyServer`]: the HTTP/1.1 front end
//!
//! # Architecture
//!
//! ```text
//!  client ──HTTP/1.1──▶ ProxyServer
//!                           │ ProxyRequest
//!                           ▼
//!                    ProxyOrchestrator ──resolve──▶ Router
//!                           │
//!                           ├──acquire/release──▶ ConnectionPool
//!                           │
//!                           └──connect──▶ TlsSessionFactory ──sign──▶ HSM
//!                                              │
//!                                              ▼
//!                                     upstream (mTLS, HTTP/1.1)
//! ```

pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod router;
pub mod server;
pub mod upstream;

// Re-export main types for convenient access
pub use error::{ProxyError, ProxyResult};
pub use orchestrator::{HealthReport, OrchestratorSettings, ProxyOrchestrator, RequestPhase};
pub use pool::{
    Checkout, ConnectionPool, DestinationStats, PoolError, PoolSettings, PoolStats,
    PoolTransport, PooledConnection, ReleaseOutcome, VacantSlot,
};
pub use router::{Destination, RouteError, Router, RoutingTable};
pub use server::{ProxyConfig, ProxyServer, ProxyServerBuilder};
pub use upstream::{Exchange, ProxyRequest, ProxyResponse, UpstreamConnection, prepare_request};
