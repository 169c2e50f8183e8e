//! Request orchestration.
//!
//! [`ProxyOrchestrator::forward`] drives one request through
//! `Resolving → Connecting → Forwarding → {Completed, Failed}`:
//!
//! 1. Resolve the destination hint against the routing table and build the
//!    outgoing request.
//! 2. Check the HSM circuit breaker. While it is open only an idle
//!    connection can serve the request, and nothing waits for one.
//! 3. Otherwise borrow a pooled connection, retrying once after a short
//!    backoff if the destination's pool is exhausted, and with no idle
//!    connection to reuse run a fresh mTLS handshake with the route's
//!    active identity.
//! 4. Send the request and buffer the response, then hand the connection
//!    back as `Reusable` or `Broken`.
//!
//! Nothing is retried once forwarding has started. The whole sequence runs
//! under one end-to-end deadline; a request cancelled mid-flight drops its
//! connection instead of returning it to the pool.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::ProxyError;
use super::pool::{Checkout, ConnectionPool, PoolStats, PooledConnection, ReleaseOutcome};
use super::router::{Destination, Router};
use super::upstream::{ProxyRequest, ProxyResponse, UpstreamConnection, prepare_request};
use crate::hsm::{HsmError, HsmHealth, HsmSessionManager};
use crate::identity::{CertificateStore, RenewalFlag, RetainedIdentity};
use crate::telemetry::{AuditEvent, AuditLogger};
use crate::tls::{TlsError, TlsSessionFactory};

/// Request-level tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// End-to-end deadline for one request.
    pub request_timeout: Duration,
    /// Pause before the single acquisition retry.
    pub retry_backoff: Duration,
    /// Largest upstream response body accepted.
    pub max_response_bytes: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(50),
            max_response_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    /// Looking up the destination.
    Resolving,
    /// Borrowing or establishing a connection.
    Connecting,
    /// Exchanging the request with the upstream.
    Forwarding,
    /// Response received.
    Completed,
    /// Ended with an error. Failures are reported with the phase they
    /// happened in.
    Failed,
}

impl RequestPhase {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPhase::Resolving => "resolving",
            RequestPhase::Connecting => "connecting",
            RequestPhase::Forwarding => "forwarding",
            RequestPhase::Completed => "completed",
            RequestPhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot for an external health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// HSM health state.
    pub hsm: HsmHealth,
    /// HSM operations currently running.
    pub hsm_in_flight: usize,
    /// HSM concurrency budget.
    pub hsm_capacity: usize,
    /// Identities inside their renewal window.
    pub renewal_due: Vec<RenewalFlag>,
    /// Superseded identities still pinned by live connections.
    pub retained: Vec<RetainedIdentity>,
    /// Pool occupancy.
    pub pool: PoolStats,
    /// Routing table version in effect.
    pub routes_version: u64,
}

/// Forwards requests to their destinations over HSM-authenticated mTLS.
pub struct ProxyOrchestrator {
    router: Arc<Router>,
    pool: Arc<ConnectionPool<UpstreamConnection>>,
    factory: Arc<TlsSessionFactory>,
    identities: Arc<CertificateStore>,
    hsm: Arc<HsmSessionManager>,
    settings: OrchestratorSettings,
    audit: Arc<AuditLogger>,
}

impl ProxyOrchestrator {
    /// Wire an orchestrator over its collaborators.
    pub fn new(
        router: Arc<Router>,
        pool: Arc<ConnectionPool<UpstreamConnection>>,
        factory: Arc<TlsSessionFactory>,
        identities: Arc<CertificateStore>,
        hsm: Arc<HsmSessionManager>,
        settings: OrchestratorSettings,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            router,
            pool,
            factory,
            identities,
            hsm,
            settings,
            audit,
        }
    }

    /// Settings in effect.
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// The router requests resolve against.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// The connection pool.
    pub fn pool(&self) -> &Arc<ConnectionPool<UpstreamConnection>> {
        &self.pool
    }

    /// The session factory.
    pub fn factory(&self) -> &Arc<TlsSessionFactory> {
        &self.factory
    }

    /// Forward `request` and return the upstream's response.
    ///
    /// Always finishes within the request deadline, with a response or one
    /// [`ProxyError`].
    pub async fn forward(&self, request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let request_id = Uuid::new_v4().to_string();
        let mut phase = RequestPhase::Resolving;

        let result = match tokio::time::timeout(
            self.settings.request_timeout,
            self.run(&request, &mut phase),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProxyError::DeadlineExceeded(self.settings.request_timeout)),
        };

        match result {
            Ok(response) => {
                debug!(
                    request_id = %request_id,
                    destination = %request.destination_hint,
                    status = %response.status,
                    "Request completed"
                );
                Ok(response)
            }
            Err(err) => {
                warn!(
                    request_id = %request_id,
                    destination = %request.destination_hint,
                    phase = %phase,
                    kind = err.kind(),
                    "Request failed: {}",
                    err
                );
                self.audit.log_with_context(
                    AuditEvent::RequestFailed {
                        request_id,
                        destination: request.destination_hint.clone(),
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                    },
                    phase.as_str(),
                );
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        request: &ProxyRequest,
        phase: &mut RequestPhase,
    ) -> Result<ProxyResponse, ProxyError> {
        *phase = RequestPhase::Resolving;
        let destination = self.router.resolve(&request.destination_hint)?;
        let outgoing = prepare_request(request, &destination)?;

        *phase = RequestPhase::Connecting;
        let mut conn = self.checkout(&destination).await?;

        *phase = RequestPhase::Forwarding;
        match conn
            .get_mut()
            .send(outgoing, self.settings.max_response_bytes)
            .await
        {
            Ok(exchange) => {
                let outcome = if exchange.keep_alive {
                    ReleaseOutcome::Reusable
                } else {
                    ReleaseOutcome::Broken
                };
                self.pool.release(conn, outcome);
                *phase = RequestPhase::Completed;
                Ok(exchange.response)
            }
            Err(err) => {
                self.pool.release(conn, ReleaseOutcome::Broken);
                Err(err)
            }
        }
    }

    /// Borrow an idle connection or build a new one.
    async fn checkout(
        &self,
        destination: &Destination,
    ) -> Result<PooledConnection<UpstreamConnection>, ProxyError> {
        let identity = self.identities.get_active(&destination.identity)?;

        // Circuit breaker: while the HSM is down only idle connections,
        // which need no signature, can serve.
        if self.hsm.health() == HsmHealth::Unavailable {
            return match self.pool.try_reuse(&destination.name, identity.version()) {
                Some(conn) => {
                    debug!(
                        destination = %destination.name,
                        version = conn.identity_version(),
                        "Reusing pooled connection with circuit open"
                    );
                    Ok(conn)
                }
                None => Err(ProxyError::HsmUnavailable(
                    "circuit open; no idle connection and handshake not attempted".to_string(),
                )),
            };
        }

        let checkout = match self.pool.acquire(&destination.name, identity.version()).await {
            Ok(checkout) => checkout,
            Err(first) => {
                debug!(destination = %destination.name, "{}; retrying once", first);
                tokio::time::sleep(self.settings.retry_backoff).await;
                self.pool
                    .acquire(&destination.name, identity.version())
                    .await
                    .map_err(|e| ProxyError::UpstreamUnavailable {
                        destination: destination.name.clone(),
                        reason: e.to_string(),
                    })?
            }
        };

        let slot = match checkout {
            Checkout::Reused(conn) => {
                debug!(
                    destination = %destination.name,
                    version = conn.identity_version(),
                    "Reusing pooled connection"
                );
                return Ok(conn);
            }
            Checkout::Vacant(slot) => slot,
        };

        // The breaker may have opened while waiting for a slot.
        if self.hsm.health() == HsmHealth::Unavailable {
            return Err(ProxyError::HsmUnavailable(
                "circuit open; handshake not attempted".to_string(),
            ));
        }

        let transport = match self.factory.connect(destination, identity.clone()).await {
            Ok(transport) => transport,
            Err(TlsError::Hsm(HsmError::InvalidKeyHandle(message))) => {
                self.identities.quarantine(&identity);
                return Err(ProxyError::InvalidKeyHandle(message));
            }
            Err(err) => return Err(err.into()),
        };

        let version = transport.identity_version();
        if transport.resumed() {
            debug!(destination = %destination.name, version, "Session resumed");
        } else {
            info!(
                destination = %destination.name,
                version,
                "Established mTLS connection"
            );
        }
        let upstream = UpstreamConnection::establish(transport).await?;
        Ok(slot.fill(upstream, version))
    }

    /// Snapshot of HSM, identity, pool and routing state.
    pub fn health_report(&self) -> HealthReport {
        HealthReport {
            hsm: self.hsm.health(),
            hsm_in_flight: self.hsm.in_flight(),
            hsm_capacity: self.hsm.capacity(),
            renewal_due: self.identities.renewal_flags(),
            retained: self.identities.retained(),
            pool: self.pool.stats(),
            routes_version: self.router.version(),
        }
    }
}

impl std::fmt::Debug for ProxyOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyOrchestrator")
            .field("routes_version", &self.router.version())
            .field("settings", &self.settings)
            .finish()
    }
}
