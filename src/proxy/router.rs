//! Destination routing.
//!
//! The routing table is immutable once built. Reloads swap in a whole new
//! table with a higher version, so a lookup never sees a half-applied
//! change and never blocks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use thiserror::Error;
use tracing::info;

use crate::config::RouteConfig;
use crate::telemetry::{AuditEvent, AuditLogger};
use crate::tls::{TlsError, TlsPolicy, read_root_store, system_roots};

/// Routing failures.
#[derive(Debug, Error)]
pub enum RouteError {
    /// No route for the hint.
    #[error("Unknown destination '{0}'")]
    UnknownDestination(String),

    /// A reload offered a table that is not newer than the current one.
    #[error("Routing table version {offered} is not newer than {current}")]
    StaleTable {
        /// Version in effect.
        current: u64,
        /// Version offered.
        offered: u64,
    },

    /// A route entry cannot be turned into a destination.
    #[error("Invalid route '{name}': {message}")]
    InvalidRoute {
        /// Route name.
        name: String,
        /// What is wrong.
        message: String,
    },

    /// A route's trust anchors could not be loaded.
    #[error("Trust anchors for route '{name}': {source}")]
    Anchors {
        /// Route name.
        name: String,
        /// Loading failure.
        source: TlsError,
    },
}

/// A resolved upstream.
#[derive(Debug, Clone)]
pub struct Destination {
    /// Logical name clients address.
    pub name: String,
    /// Upstream `HOST:PORT`.
    pub address: String,
    /// TLS server name (SNI and certificate check).
    pub server_name: ServerName<'static>,
    /// Server verification policy.
    pub tls: TlsPolicy,
    /// Identity presented to this upstream.
    pub identity: String,
}

/// A versioned set of destinations.
#[derive(Debug, Default)]
pub struct RoutingTable {
    version: u64,
    routes: HashMap<String, Arc<Destination>>,
}

impl RoutingTable {
    /// Table holding `destinations` at `version`.
    pub fn new(version: u64, destinations: impl IntoIterator<Item = Destination>) -> Self {
        let routes = destinations
            .into_iter()
            .map(|d| (d.name.clone(), Arc::new(d)))
            .collect();
        Self { version, routes }
    }

    /// Build a table from `[routes.*]` entries, loading trust anchors.
    pub fn from_config(
        version: u64,
        routes: &BTreeMap<String, RouteConfig>,
    ) -> Result<Self, RouteError> {
        let mut destinations = Vec::with_capacity(routes.len());
        let mut system: Option<Arc<RootCertStore>> = None;

        for (name, route) in routes {
            let server_name = route
                .server_name()
                .ok_or_else(|| RouteError::InvalidRoute {
                    name: name.clone(),
                    message: format!("cannot derive a server name from '{}'", route.address),
                })
                .and_then(|sn| {
                    ServerName::try_from(sn.to_string()).map_err(|e| RouteError::InvalidRoute {
                        name: name.clone(),
                        message: format!("server name '{}': {}", sn, e),
                    })
                })?;

            let anchors_err = |source| RouteError::Anchors {
                name: name.clone(),
                source,
            };
            let anchors = if route.trust_anchors.is_empty() {
                match &system {
                    Some(roots) => roots.clone(),
                    None => {
                        let roots = Arc::new(system_roots().map_err(anchors_err)?);
                        system = Some(roots.clone());
                        roots
                    }
                }
            } else {
                let mut roots = read_root_store(&route.trust_anchors).map_err(anchors_err)?;
                if route.system_roots {
                    roots.extend(system_roots().map_err(anchors_err)?.roots);
                }
                Arc::new(roots)
            };

            destinations.push(Destination {
                name: name.clone(),
                address: route.address.clone(),
                server_name,
                tls: TlsPolicy::shared(anchors, route.hostname_verification),
                identity: route.identity_name().to_string(),
            });
        }

        Ok(Self::new(version, destinations))
    }

    /// Table version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table has no routes.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Route names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn get(&self, hint: &str) -> Option<&Arc<Destination>> {
        self.routes.get(hint)
    }
}

/// Resolves destination hints against the current routing table.
pub struct Router {
    table: ArcSwap<RoutingTable>,
    audit: Arc<AuditLogger>,
}

impl Router {
    /// Router serving `table`.
    pub fn new(table: RoutingTable, audit: Arc<AuditLogger>) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
            audit,
        }
    }

    /// Resolve `hint` by exact name.
    pub fn resolve(&self, hint: &str) -> Result<Arc<Destination>, RouteError> {
        self.table
            .load()
            .get(hint)
            .cloned()
            .ok_or_else(|| RouteError::UnknownDestination(hint.to_string()))
    }

    /// Replace the table with a newer one.
    ///
    /// Returns the table that was replaced.
    pub fn reload(&self, table: RoutingTable) -> Result<Arc<RoutingTable>, RouteError> {
        let current = self.table.load_full();
        if table.version <= current.version {
            return Err(RouteError::StaleTable {
                current: current.version,
                offered: table.version,
            });
        }

        let version = table.version;
        let routes = table.len();
        let previous = self.table.compare_and_swap(&current, Arc::new(table));
        if !Arc::ptr_eq(&*previous, &current) {
            // Lost a race with another reload.
            return Err(RouteError::StaleTable {
                current: previous.version,
                offered: version,
            });
        }

        info!("Routing table v{} installed ({} routes)", version, routes);
        self.audit.log(AuditEvent::RoutesReloaded { version, routes });
        Ok(current)
    }

    /// Version of the table in effect.
    pub fn version(&self) -> u64 {
        self.table.load().version
    }

    /// The table in effect.
    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DevPki;
    use crate::tls::HostnameVerification;
    use std::path::PathBuf;

    fn destination(name: &str, address: &str, anchors: RootCertStore) -> Destination {
        Destination {
            name: name.to_string(),
            address: address.to_string(),
            server_name: ServerName::try_from(format!("{}.internal", name)).unwrap(),
            tls: TlsPolicy::new(anchors, HostnameVerification::Strict),
            identity: "default".to_string(),
        }
    }

    fn router(table: RoutingTable) -> Router {
        Router::new(table, Arc::new(AuditLogger::new_null()))
    }

    #[test]
    fn test_billing_route_resolves_to_its_upstream() {
        let billing_ca = DevPki::generate("billing CA").unwrap();
        let ledger_ca = DevPki::generate("ledger CA").unwrap();
        let router = router(RoutingTable::new(
            1,
            [
                destination("billing", "10.0.0.5:8443", billing_ca.root_store()),
                destination("ledger", "10.0.0.6:8443", ledger_ca.root_store()),
            ],
        ));

        let resolved = router.resolve("billing").unwrap();
        assert_eq!(resolved.name, "billing");
        assert_eq!(resolved.address, "10.0.0.5:8443");
        let anchor = &resolved.tls.anchors().roots[0];
        let expected = &billing_ca.root_store().roots[0];
        assert_eq!(anchor.subject.as_ref(), expected.subject.as_ref());

        // Same hint, same destination, no side effects.
        let again = router.resolve("billing").unwrap();
        assert!(Arc::ptr_eq(&resolved, &again));
        assert_eq!(router.version(), 1);
    }

    #[test]
    fn test_unknown_and_prefix_hints_rejected() {
        let pki = DevPki::generate("test CA").unwrap();
        let router = router(RoutingTable::new(
            1,
            [destination("billing", "10.0.0.5:8443", pki.root_store())],
        ));

        for hint in ["ledger", "bill", "billing.internal", "BILLING", ""] {
            assert!(matches!(
                router.resolve(hint),
                Err(RouteError::UnknownDestination(_))
            ));
        }
    }

    #[test]
    fn test_reload_requires_newer_version() {
        let pki = DevPki::generate("test CA").unwrap();
        let router = router(RoutingTable::new(
            3,
            [destination("billing", "10.0.0.5:8443", pki.root_store())],
        ));

        let stale = RoutingTable::new(
            3,
            [destination("billing", "10.0.0.9:8443", pki.root_store())],
        );
        assert!(matches!(
            router.reload(stale),
            Err(RouteError::StaleTable { current: 3, offered: 3 })
        ));

        let newer = RoutingTable::new(
            4,
            [destination("ledger", "10.0.0.6:8443", pki.root_store())],
        );
        let previous = router.reload(newer).unwrap();
        assert_eq!(previous.version(), 3);
        assert_eq!(router.version(), 4);
        assert!(router.resolve("billing").is_err());
        assert_eq!(router.resolve("ledger").unwrap().address, "10.0.0.6:8443");
    }

    #[test]
    fn test_resolved_destination_survives_reload() {
        let pki = DevPki::generate("test CA").unwrap();
        let router = router(RoutingTable::new(
            1,
            [destination("billing", "10.0.0.5:8443", pki.root_store())],
        ));
        let held = router.resolve("billing").unwrap();

        router
            .reload(RoutingTable::new(
                2,
                [destination("billing", "10.0.0.9:8443", pki.root_store())],
            ))
            .unwrap();

        assert_eq!(held.address, "10.0.0.5:8443");
        assert_eq!(router.resolve("billing").unwrap().address, "10.0.0.9:8443");
    }

    #[test]
    fn test_table_from_config() {
        let pki = DevPki::generate("test CA").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("ca.pem");
        std::fs::write(&ca_path, pki.ca_cert_pem()).unwrap();

        let mut routes = BTreeMap::new();
        routes.insert(
            "billing".to_string(),
            RouteConfig {
                address: "10.0.0.5:8443".to_string(),
                server_name: Some("billing.internal".to_string()),
                trust_anchors: vec![ca_path],
                hostname_verification: HostnameVerification::SkipHostname,
                identity: Some("ops".to_string()),
                ..Default::default()
            },
        );

        let table = RoutingTable::from_config(7, &routes).unwrap();
        assert_eq!(table.version(), 7);
        assert_eq!(table.names(), vec!["billing"]);

        let billing = table.get("billing").unwrap();
        assert_eq!(billing.identity, "ops");
        assert_eq!(
            billing.server_name,
            ServerName::try_from("billing.internal").unwrap()
        );
        assert_eq!(billing.tls.hostname(), HostnameVerification::SkipHostname);
        assert_eq!(billing.tls.anchors().len(), 1);
    }

    #[test]
    fn test_table_from_config_missing_anchor_file() {
        let mut routes = BTreeMap::new();
        routes.insert(
            "billing".to_string(),
            RouteConfig {
                address: "10.0.0.5:8443".to_string(),
                trust_anchors: vec![PathBuf::from("/nonexistent/ca.pem")],
                ..Default::default()
            },
        );

        assert!(matches!(
            RoutingTable::from_config(1, &routes),
            Err(RouteError::Anchors { .. })
        ));
    }
}
