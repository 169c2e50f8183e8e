//! Certificate store: active identities, rotation and expiry watching.
//!
//! Readers load the active map through an [`ArcSwap`], so a rotation never
//! blocks a handshake. A rotation validates the candidate first (validity
//! window, key consistency with the HSM, chain of trust) and only then swaps
//! the pointer. Handshakes that already hold the previous `Arc<Identity>`
//! finish with it; the store keeps a weak reference so operators can see
//! which superseded versions are still alive.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rustls::RootCertStore;
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use rustls_pki_types::UnixTime;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::IdentityError;
use super::material::Identity;
use crate::telemetry::{AuditEvent, AuditLogger};

/// Default share of the lifetime left at which an identity is flagged.
pub const DEFAULT_RENEWAL_FRACTION: f64 = 0.2;

/// An identity flagged for renewal by the expiry watcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenewalFlag {
    /// Logical identity name.
    pub name: String,
    /// Version of the flagged identity.
    pub version: u64,
    /// Leaf notAfter.
    pub not_after: DateTime<Utc>,
    /// Seconds of validity left when flagged.
    pub remaining_sec: i64,
}

/// A superseded identity still pinned by a live connection or handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetainedIdentity {
    /// Logical identity name.
    pub name: String,
    /// Version of the superseded identity.
    pub version: u64,
}

type ActiveMap = HashMap<String, Arc<Identity>>;

/// Holds the active identity per logical name.
pub struct CertificateStore {
    active: ArcSwap<ActiveMap>,
    retired: Mutex<Vec<(String, Weak<Identity>)>>,
    renewal_due: Mutex<HashMap<String, RenewalFlag>>,
    chain_verifier: Option<Arc<dyn ClientCertVerifier>>,
    renewal_fraction: f64,
    audit: Arc<AuditLogger>,
}

impl CertificateStore {
    /// Create an empty store.
    ///
    /// With `anchors`, rotations also verify the chain of trust. Without
    /// them only the validity window and key consistency are checked.
    pub fn new(
        anchors: Option<RootCertStore>,
        renewal_fraction: f64,
        audit: Arc<AuditLogger>,
    ) -> Result<Self, IdentityError> {
        let chain_verifier = match anchors {
            Some(roots) => {
                let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                        .build()
                        .map_err(|e| IdentityError::Anchors(e.to_string()))?;
                Some(verifier)
            }
            None => {
                debug!("No identity trust anchors configured; chain check disabled");
                None
            }
        };

        Ok(Self {
            active: ArcSwap::from_pointee(HashMap::new()),
            retired: Mutex::new(Vec::new()),
            renewal_due: Mutex::new(HashMap::new()),
            chain_verifier,
            renewal_fraction: renewal_fraction.clamp(0.0, 1.0),
            audit,
        })
    }

    /// Active identity for `name`.
    ///
    /// The returned `Arc` pins the identity for one handshake; callers must
    /// not keep it across requests.
    pub fn get_active(&self, name: &str) -> Result<Arc<Identity>, IdentityError> {
        let map = self.active.load();
        let identity = map
            .get(name)
            .ok_or_else(|| IdentityError::NotFound(name.to_string()))?;

        if identity.is_key_invalid() {
            return Err(IdentityError::KeyHandleInvalid {
                name: name.to_string(),
                version: identity.version(),
                label: identity.key().label().to_string(),
            });
        }
        Ok(Arc::clone(identity))
    }

    /// Version of the active identity for `name`.
    pub fn active_version(&self, name: &str) -> Option<u64> {
        self.active.load().get(name).map(|i| i.version())
    }

    /// Names with an installed identity, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.active.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate `identity` and make it the active identity for `name`.
    pub async fn rotate(
        &self,
        name: &str,
        identity: Identity,
    ) -> Result<Arc<Identity>, IdentityError> {
        self.rotate_at(name, identity, Utc::now()).await
    }

    /// [`rotate`](Self::rotate) with an explicit clock.
    pub async fn rotate_at(
        &self,
        name: &str,
        identity: Identity,
        now: DateTime<Utc>,
    ) -> Result<Arc<Identity>, IdentityError> {
        if let Err(e) = self.validate(name, &identity, now).await {
            warn!("Rejected identity '{}' v{}: {}", name, identity.version(), e);
            self.audit.log(AuditEvent::IdentityRejected {
                name: name.to_string(),
                reason: e.to_string(),
            });
            return Err(e);
        }

        let installed = Arc::new(identity);
        let previous = self.active.rcu(|map| {
            let mut next = ActiveMap::clone(map);
            next.insert(name.to_string(), Arc::clone(&installed));
            next
        });
        let replaced = previous.get(name).map(|old| {
            old.mark_superseded();
            let mut retired = self.retired.lock().unwrap();
            retired.retain(|(_, weak)| weak.strong_count() > 0);
            retired.push((name.to_string(), Arc::downgrade(old)));
            old.version()
        });
        drop(previous);

        self.renewal_due.lock().unwrap().remove(name);

        info!(
            "Installed identity '{}' v{} (subject {}, expires {}){}",
            name,
            installed.version(),
            installed.subject(),
            installed.not_after(),
            replaced
                .map(|v| format!(", replacing v{}", v))
                .unwrap_or_default()
        );
        self.audit.log(AuditEvent::IdentityInstalled {
            name: name.to_string(),
            version: installed.version(),
            replaced,
            not_after: installed.not_after(),
        });

        Ok(installed)
    }

    async fn validate(
        &self,
        name: &str,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<(), IdentityError> {
        if identity.name() != name {
            return Err(IdentityError::NameMismatch {
                expected: name.to_string(),
                actual: identity.name().to_string(),
            });
        }
        if now < identity.not_before() {
            return Err(IdentityError::NotYetValid {
                name: name.to_string(),
                not_before: identity.not_before(),
            });
        }
        if now > identity.not_after() {
            return Err(IdentityError::Expired {
                name: name.to_string(),
                not_after: identity.not_after(),
            });
        }

        let hsm_key = identity.key().public_key().await?;
        if hsm_key != identity.leaf_public_key() {
            return Err(IdentityError::KeyMismatch {
                name: name.to_string(),
                label: identity.key().label().to_string(),
            });
        }

        if let Some(verifier) = &self.chain_verifier {
            let chain = identity.chain();
            let at = UnixTime::since_unix_epoch(Duration::from_secs(now.timestamp().max(0) as u64));
            verifier
                .verify_client_cert(&chain[0], &chain[1..], at)
                .map_err(|e| IdentityError::UntrustedChain {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Superseded identities still referenced somewhere, by name then version.
    pub fn retained(&self) -> Vec<RetainedIdentity> {
        let mut retired = self.retired.lock().unwrap();
        retired.retain(|(_, weak)| weak.strong_count() > 0);
        let mut retained: Vec<RetainedIdentity> = retired
            .iter()
            .filter_map(|(name, weak)| {
                weak.upgrade().map(|identity| RetainedIdentity {
                    name: name.clone(),
                    version: identity.version(),
                })
            })
            .collect();
        retained.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        retained
    }

    /// Superseded versions of `name` still referenced somewhere.
    pub fn retained_versions(&self, name: &str) -> Vec<u64> {
        self.retained()
            .into_iter()
            .filter(|r| r.name == name)
            .map(|r| r.version)
            .collect()
    }

    /// Number of bookkeeping entries for superseded identities.
    #[cfg(test)]
    fn retired_entries(&self) -> usize {
        self.retired.lock().unwrap().len()
    }

    /// Quarantine `identity` after the HSM rejected its key handle.
    ///
    /// Other identities keep working; `get_active` for this one fails until
    /// a rotation installs a replacement.
    pub fn quarantine(&self, identity: &Identity) {
        if identity.mark_key_invalid() {
            error!(
                "Key handle '{}' for identity '{}' v{} rejected by HSM; identity quarantined until rotation",
                identity.key().label(),
                identity.name(),
                identity.version()
            );
            self.audit.log(AuditEvent::KeyHandleInvalid {
                name: identity.name().to_string(),
                version: identity.version(),
                label: identity.key().label().to_string(),
            });
        }
    }

    /// Re-evaluate renewal flags now.
    pub fn check_expiry(&self) -> Vec<RenewalFlag> {
        self.check_expiry_at(Utc::now())
    }

    /// Re-evaluate renewal flags at `now`.
    ///
    /// Returns every identity currently inside its renewal window. Newly
    /// flagged identities are logged and audited once.
    pub fn check_expiry_at(&self, now: DateTime<Utc>) -> Vec<RenewalFlag> {
        let map = self.active.load();
        let mut due = self.renewal_due.lock().unwrap();
        let mut flagged = HashSet::new();

        for (name, identity) in map.iter() {
            if !identity.needs_renewal_at(now, self.renewal_fraction) {
                continue;
            }
            flagged.insert(name.clone());

            let already = due
                .get(name)
                .is_some_and(|flag| flag.version == identity.version());
            let flag = RenewalFlag {
                name: name.clone(),
                version: identity.version(),
                not_after: identity.not_after(),
                remaining_sec: identity.remaining_at(now).num_seconds(),
            };
            if !already {
                warn!(
                    "Identity '{}' v{} due for rotation: {}s of validity left",
                    name, flag.version, flag.remaining_sec
                );
                self.audit.log(AuditEvent::RotationDue {
                    name: name.clone(),
                    version: flag.version,
                    not_after: flag.not_after,
                    remaining_sec: flag.remaining_sec,
                });
            }
            due.insert(name.clone(), flag);
        }
        due.retain(|name, _| flagged.contains(name));

        let mut flags: Vec<RenewalFlag> = due.values().cloned().collect();
        flags.sort_by(|a, b| a.name.cmp(&b.name));
        flags
    }

    /// Identities currently flagged for renewal.
    pub fn renewal_flags(&self) -> Vec<RenewalFlag> {
        let mut flags: Vec<RenewalFlag> =
            self.renewal_due.lock().unwrap().values().cloned().collect();
        flags.sort_by(|a, b| a.name.cmp(&b.name));
        flags
    }

    /// Spawn the polling expiry watcher.
    pub fn spawn_expiry_watcher(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let flags = store.check_expiry();
                        debug!("Expiry check: {} identities due for rotation", flags.len());
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Expiry watcher stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
