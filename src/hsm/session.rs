//! HSM session manager: admission gate, timeouts and health.
//!
//! Every device call goes through one [`HsmSessionManager`]. It enforces the
//! hardware's parallelism with a counting semaphore, bounds how long callers
//! queue for a slot, bounds how long a device call may run, and keeps a
//! health state that the orchestrator's circuit breaker reads.
//!
//! Health transitions:
//!
//! ```text
//!  Healthy ──(N slow calls in a row)──▶ Degraded
//!     │                                     │
//!     └───(M failed calls in a row)──▶ Unavailable ◀──┘
//!
//!  any state ──(successful probe)──▶ Healthy
//! ```
//!
//! Only a probe brings the state back to `Healthy`; ordinary successes reset
//! the streak counters but leave the state alone.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{HsmError, KeyStoreError};
use super::keystore::{KeyStore, SigningAlgorithm};
use crate::telemetry::{AuditEvent, AuditLogger};

/// Health of the HSM as seen by the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HsmHealth {
    /// Calls complete within the latency threshold.
    Healthy,
    /// Calls complete, but consistently slowly.
    Degraded,
    /// Calls consistently fail; new handshakes are short-circuited.
    Unavailable,
}

impl std::fmt::Display for HsmHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HsmHealth::Healthy => write!(f, "healthy"),
            HsmHealth::Degraded => write!(f, "degraded"),
            HsmHealth::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Tuning for the session manager.
#[derive(Debug, Clone)]
pub struct HsmSettings {
    /// Maximum simultaneous device operations.
    pub max_concurrent: usize,
    /// Longest a caller waits for an admission slot.
    pub queue_timeout: Duration,
    /// Longest a single device call may take.
    pub sign_timeout: Duration,
    /// Calls slower than this count as slow.
    pub slow_threshold: Duration,
    /// Consecutive slow calls before `Degraded`.
    pub degraded_after: u32,
    /// Consecutive failed calls before `Unavailable`.
    pub unavailable_after: u32,
}

impl Default for HsmSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            queue_timeout: Duration::from_millis(500),
            sign_timeout: Duration::from_secs(2),
            slow_threshold: Duration::from_millis(250),
            degraded_after: 3,
            unavailable_after: 3,
        }
    }
}

#[derive(Debug)]
struct HealthTracker {
    state: HsmHealth,
    slow_streak: u32,
    failure_streak: u32,
}

/// Shared gatekeeper for all key operations against one key store.
pub struct HsmSessionManager {
    store: Arc<dyn KeyStore>,
    settings: HsmSettings,
    gate: Arc<Semaphore>,
    health: Mutex<HealthTracker>,
    audit: Arc<AuditLogger>,
}

impl HsmSessionManager {
    /// Create a session manager over `store`.
    pub fn new(store: Arc<dyn KeyStore>, settings: HsmSettings, audit: Arc<AuditLogger>) -> Self {
        let permits = settings.max_concurrent.max(1);
        info!(
            "HSM session manager ready: backend={}, budget={}",
            store.backend(),
            permits
        );
        Self {
            store,
            gate: Arc::new(Semaphore::new(permits)),
            settings: HsmSettings {
                max_concurrent: permits,
                ..settings
            },
            health: Mutex::new(HealthTracker {
                state: HsmHealth::Healthy,
                slow_streak: 0,
                failure_streak: 0,
            }),
            audit,
        }
    }

    /// Current health state.
    pub fn health(&self) -> HsmHealth {
        self.health.lock().unwrap().state
    }

    /// Number of device operations currently admitted.
    pub fn in_flight(&self) -> usize {
        self.settings.max_concurrent - self.gate.available_permits()
    }

    /// Size of the admission budget.
    pub fn capacity(&self) -> usize {
        self.settings.max_concurrent
    }

    /// Settings this manager was built with.
    pub fn settings(&self) -> &HsmSettings {
        &self.settings
    }

    /// Sign `digest` with the key under `label`.
    ///
    /// Fails immediately with [`HsmError::Unavailable`] while the health state
    /// is `Unavailable`.
    pub async fn sign(
        &self,
        label: &str,
        digest: &[u8],
        algorithm: SigningAlgorithm,
    ) -> Result<Vec<u8>, HsmError> {
        self.ensure_not_unavailable()?;
        let label = label.to_string();
        let digest = digest.to_vec();
        self.run("sign", move |store| store.sign(&label, &digest, algorithm))
            .await
    }

    /// Public key bytes for the key under `label`.
    pub async fn public_key(&self, label: &str) -> Result<Vec<u8>, HsmError> {
        self.ensure_not_unavailable()?;
        let label = label.to_string();
        self.run("public_key", move |store| store.public_key(&label))
            .await
    }

    /// Probe the device and update health.
    ///
    /// A successful probe is the only way back to `Healthy`.
    pub async fn probe(&self) -> HsmHealth {
        match self.run("probe", |store| store.probe()).await {
            Ok(()) => {
                let mut tracker = self.health.lock().unwrap();
                tracker.slow_streak = 0;
                tracker.failure_streak = 0;
                let before = tracker.state;
                tracker.state = HsmHealth::Healthy;
                drop(tracker);
                self.report_transition(before, HsmHealth::Healthy, "probe succeeded");
                HsmHealth::Healthy
            }
            Err(e) => {
                debug!("HSM probe failed: {}", e);
                self.health()
            }
        }
    }

    /// Spawn the periodic health probe.
    ///
    /// The task stops when `shutdown_rx` turns `true`.
    pub fn spawn_health_probe(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let health = manager.probe().await;
                        debug!("HSM probe: {}", health);
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("HSM health probe stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn ensure_not_unavailable(&self) -> Result<(), HsmError> {
        if self.health() == HsmHealth::Unavailable {
            return Err(HsmError::Unavailable(
                "HSM marked unavailable; waiting for a successful probe".to_string(),
            ));
        }
        Ok(())
    }

    /// Run one device call through the admission gate and timeouts.
    async fn run<T, F>(&self, operation: &'static str, call: F) -> Result<T, HsmError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn KeyStore) -> Result<T, KeyStoreError> + Send + 'static,
    {
        let permit = match tokio::time::timeout(
            self.settings.queue_timeout,
            Arc::clone(&self.gate).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(HsmError::Unavailable(
                    "admission gate closed".to_string(),
                ));
            }
            Err(_) => {
                warn!(
                    "HSM admission queue full for {} after {:?}",
                    operation, self.settings.queue_timeout
                );
                return Err(HsmError::Backpressure(self.settings.queue_timeout));
            }
        };

        let store = Arc::clone(&self.store);
        let started = Instant::now();
        // The permit moves into the blocking task, so a call that outlives
        // its timeout still occupies its slot until the device returns.
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            call(store.as_ref())
        });

        let outcome = match tokio::time::timeout(self.settings.sign_timeout, task).await {
            Ok(Ok(result)) => result.map_err(HsmError::from),
            Ok(Err(join_err)) => Err(HsmError::Unavailable(format!(
                "{} task failed: {}",
                operation, join_err
            ))),
            Err(_) => Err(HsmError::Timeout(self.settings.sign_timeout)),
        };

        let elapsed = started.elapsed();
        match &outcome {
            Ok(_) => debug!("HSM {} completed in {:?}", operation, elapsed),
            Err(e) => warn!("HSM {} failed after {:?}: {}", operation, elapsed, e),
        }
        self.record(elapsed, outcome.as_ref().err());
        outcome
    }

    fn record(&self, elapsed: Duration, error: Option<&HsmError>) {
        let mut tracker = self.health.lock().unwrap();
        let before = tracker.state;

        match error {
            None => {
                tracker.failure_streak = 0;
                if elapsed > self.settings.slow_threshold {
                    tracker.slow_streak += 1;
                } else {
                    tracker.slow_streak = 0;
                }
            }
            Some(e) if e.counts_against_health() => {
                tracker.failure_streak += 1;
                if matches!(e, HsmError::Timeout(_)) {
                    tracker.slow_streak += 1;
                }
            }
            Some(_) => return,
        }

        if tracker.failure_streak >= self.settings.unavailable_after {
            tracker.state = HsmHealth::Unavailable;
        } else if tracker.slow_streak >= self.settings.degraded_after
            && tracker.state == HsmHealth::Healthy
        {
            tracker.state = HsmHealth::Degraded;
        }

        let after = tracker.state;
        let reason = format!(
            "{} consecutive failures, {} consecutive slow calls",
            tracker.failure_streak, tracker.slow_streak
        );
        drop(tracker);
        self.report_transition(before, after, &reason);
    }

    fn report_transition(&self, before: HsmHealth, after: HsmHealth, reason: &str) {
        if before == after {
            return;
        }
        if after == HsmHealth::Healthy {
            info!("HSM health {} -> {} ({})", before, after, reason);
        } else {
            warn!("HSM health {} -> {} ({})", before, after, reason);
        }
        self.audit.log(AuditEvent::HsmHealthChanged {
            from: before,
            to: after,
            reason: reason.to_string(),
        });
    }
}

impl std::fmt::Debug for HsmSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmSessionManager")
            .field("backend", &self.store.backend())
            .field("settings", &self.settings)
            .field("health", &self.health())
            .finish()
    }
}
