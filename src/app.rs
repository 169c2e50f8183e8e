//! Service assembly and lifecycle.
//!
//! Builds every component from a [`Config`], passes each its collaborators
//! explicitly, starts the background tasks and serves until interrupted.
//!
//! Signals:
//! - `SIGINT`/`SIGTERM`: graceful shutdown
//! - `SIGHUP`: re-read configuration; install changed identities and a new
//!   routing table version
//! - `SIGUSR1`: log a health report as JSON

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use hyper::header::HeaderName;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cli::Cli;
use crate::config::{Config, ConfigLoader, IdentityConfig, RouteConfig};
use crate::hsm::{HsmSessionManager, KeyHandle, SoftKeyStore};
use crate::identity::{CertificateStore, Identity, IdentityError};
use crate::proxy::{
    ConnectionPool, ProxyOrchestrator, ProxyServerBuilder, Router, RoutingTable,
    UpstreamConnection,
};
use crate::telemetry::{AuditEvent, AuditLogger};
use crate::tls::{TlsSessionFactory, read_root_store};

/// All long-lived components of a running proxy.
pub struct Services {
    /// Software key store behind the session manager.
    pub keys: Arc<SoftKeyStore>,
    /// HSM session manager.
    pub hsm: Arc<HsmSessionManager>,
    /// Active identities.
    pub identities: Arc<CertificateStore>,
    /// Destination routing.
    pub router: Arc<Router>,
    /// Upstream connections.
    pub pool: Arc<ConnectionPool<UpstreamConnection>>,
    /// Handshake factory.
    pub factory: Arc<TlsSessionFactory>,
    /// Request forwarding.
    pub orchestrator: Arc<ProxyOrchestrator>,
    routes: Mutex<BTreeMap<String, RouteConfig>>,
}

/// What a configuration reload changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    /// Identities rotated to new material.
    pub rotated: Vec<String>,
    /// Identities whose new material was rejected.
    pub rejected: Vec<String>,
    /// New routing table version, if the routes changed.
    pub routes_version: Option<u64>,
}

impl Services {
    /// Build all components and install the configured identities.
    pub async fn build(config: &Config, audit: Arc<AuditLogger>) -> Result<Self> {
        let keys = Arc::new(SoftKeyStore::new());
        load_keys(&keys, config)?;
        let hsm = Arc::new(HsmSessionManager::new(
            keys.clone(),
            config.hsm.settings(),
            audit.clone(),
        ));

        let anchors = if config.identity.trust_anchors.is_empty() {
            None
        } else {
            Some(
                read_root_store(&config.identity.trust_anchors)
                    .context("Failed to load identity trust anchors")?,
            )
        };
        let identities = Arc::new(
            CertificateStore::new(anchors, config.identity.renewal_fraction(), audit.clone())
                .context("Failed to create certificate store")?,
        );
        for (name, identity_config) in &config.identities {
            let identity = load_identity(name, identity_config, &hsm)
                .with_context(|| format!("Failed to load identity '{}'", name))?;
            identities
                .rotate(name, identity)
                .await
                .with_context(|| format!("Identity '{}' rejected", name))?;
        }

        let table =
            RoutingTable::from_config(1, &config.routes).context("Failed to build routing table")?;
        let router = Arc::new(Router::new(table, audit.clone()));
        let pool = Arc::new(ConnectionPool::new(config.pool.settings()));
        let factory = Arc::new(TlsSessionFactory::new(config.proxy.factory_settings()));
        let orchestrator = Arc::new(ProxyOrchestrator::new(
            router.clone(),
            pool.clone(),
            factory.clone(),
            identities.clone(),
            hsm.clone(),
            config.proxy.orchestrator_settings(),
            audit,
        ));

        info!(
            "Loaded {} routes and {} identities",
            router.table().len(),
            identities.names().len()
        );

        Ok(Self {
            keys,
            hsm,
            identities,
            router,
            pool,
            factory,
            orchestrator,
            routes: Mutex::new(config.routes.clone()),
        })
    }

    /// Apply identity and route changes from `config`.
    ///
    /// Listener, HSM and pool settings only take effect on restart.
    pub async fn reload(&self, config: &Config) -> Result<ReloadSummary> {
        let mut summary = ReloadSummary::default();
        load_keys(&self.keys, config)?;

        for (name, identity_config) in &config.identities {
            let candidate = match load_identity(name, identity_config, &self.hsm) {
                Ok(identity) => identity,
                Err(e) => {
                    error!("Cannot load identity '{}': {}", name, e);
                    summary.rejected.push(name.clone());
                    continue;
                }
            };
            if let Ok(active) = self.identities.get_active(name)
                && active.chain() == candidate.chain()
                && active.key().label() == candidate.key().label()
            {
                debug!("Identity '{}' unchanged", name);
                continue;
            }
            match self.identities.rotate(name, candidate).await {
                Ok(_) => summary.rotated.push(name.clone()),
                Err(e) => {
                    error!("Rotation of '{}' rejected: {}", name, e);
                    summary.rejected.push(name.clone());
                }
            }
        }

        let mut routes = self.routes.lock().unwrap();
        if *routes != config.routes {
            let table = RoutingTable::from_config(self.router.version() + 1, &config.routes)
                .context("Failed to build routing table")?;
            let version = table.version();
            self.router.reload(table)?;

            // Connections and sessions to changed or removed upstreams
            // must not be reused.
            for (name, old) in routes.iter() {
                if config.routes.get(name) != Some(old) {
                    self.pool.remove_destination(name);
                    self.factory.forget_sessions(name);
                }
            }
            *routes = config.routes.clone();
            summary.routes_version = Some(version);
        }

        Ok(summary)
    }
}

fn load_keys(keys: &SoftKeyStore, config: &Config) -> Result<()> {
    for (label, path) in &config.hsm.keys {
        keys.load_pem_file(label, path)
            .with_context(|| format!("Failed to load key '{}' from {:?}", label, path))?;
    }
    Ok(())
}

fn load_identity(
    name: &str,
    config: &IdentityConfig,
    hsm: &Arc<HsmSessionManager>,
) -> Result<Identity, IdentityError> {
    let key = KeyHandle::new(config.key_label.as_str(), config.algorithm, hsm.clone());
    Identity::from_pem_file(name, &config.chain, key)
}

/// Run the proxy until interrupted.
pub fn run(cli: &Cli, loader: ConfigLoader, config: Config) -> Result<()> {
    // Handshake signatures block a worker thread, which needs the
    // multi-threaded scheduler.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(serve(cli, loader, config))
}

async fn serve(cli: &Cli, loader: ConfigLoader, config: Config) -> Result<()> {
    let started = Instant::now();
    let audit = Arc::new(audit_logger(&config));
    let services = Services::build(&config, audit.clone()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = vec![
        services
            .hsm
            .spawn_health_probe(config.hsm.probe_interval(), shutdown_rx.clone()),
        services
            .identities
            .spawn_expiry_watcher(config.identity.watch_interval(), shutdown_rx.clone()),
        services
            .pool
            .spawn_reaper(config.pool.reap_interval(), shutdown_rx.clone()),
    ];

    let header = HeaderName::from_bytes(config.listener.destination_header().as_bytes())
        .context("Invalid destination header name")?;
    let server = ProxyServerBuilder::new()
        .listen_address(config.listener.address())
        .destination_header(header)
        .orchestrator(services.orchestrator.clone())
        .bind(shutdown_rx.clone())
        .await
        .with_context(|| format!("Failed to bind {}", config.listener.address()))?;
    let listen = server.local_addr()?.to_string();

    audit.log(AuditEvent::ServiceStart {
        pid: std::process::id(),
        listen,
        routes: services.router.table().len(),
        identities: services.identities.names().len(),
    });
    let server_task = tokio::spawn(server.run());

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut usr1 =
        signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = terminate.recv() => {
                info!("Terminated, shutting down");
                break;
            }
            _ = hangup.recv() => {
                info!("Reloading configuration");
                match loader.load(cli) {
                    Ok(new_config) => match services.reload(&new_config).await {
                        Ok(summary) => info!(
                            "Reload done: rotated {:?}, rejected {:?}, routes v{}",
                            summary.rotated,
                            summary.rejected,
                            services.router.version()
                        ),
                        Err(e) => error!("Reload failed: {:#}", e),
                    },
                    Err(e) => error!("Reload failed, keeping current configuration: {}", e),
                }
            }
            _ = usr1.recv() => {
                match serde_json::to_string(&services.orchestrator.health_report()) {
                    Ok(json) => info!("Health: {}", json),
                    Err(e) => warn!("Cannot serialize health report: {}", e),
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    match server_task.await {
        Ok(Err(e)) => warn!("Proxy server ended with error: {}", e),
        Err(e) => warn!("Proxy server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    for task in tasks {
        let _ = task.await;
    }

    audit.log(AuditEvent::ServiceStop {
        uptime_sec: started.elapsed().as_secs(),
    });
    Ok(())
}

fn audit_logger(config: &Config) -> AuditLogger {
    if !config.telemetry.syslog_enabled() {
        return AuditLogger::new_null();
    }
    match AuditLogger::new() {
        Ok(logger) => logger,
        Err(e) => {
            warn!("{}; audit events will be dropped", e);
            AuditLogger::new_null()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DevPki;
    use crate::proxy::{ProxyError, ProxyRequest};
    use crate::testing::{UPSTREAM_HOST, spawn_upstream};
    use chrono::{Duration as ChronoDuration, Utc};
    use hyper::Method;
    use std::path::Path;

    fn write_client(pki: &DevPki, dir: &Path, label: &str) -> IdentityConfig {
        let now = Utc::now();
        let issued = pki
            .issue_client(label, now - ChronoDuration::minutes(1), now + ChronoDuration::hours(1))
            .unwrap();
        let chain = dir.join(format!("{}.pem", label));
        std::fs::write(&chain, &issued.chain_pem).unwrap();
        std::fs::write(dir.join(format!("{}.key", label)), &issued.key_pem).unwrap();
        IdentityConfig {
            chain,
            key_label: label.to_string(),
            algorithm: crate::hsm::SigningAlgorithm::EcdsaP256Sha256,
        }
    }

    fn config_for(pki: &DevPki, dir: &Path, upstream: std::net::SocketAddr, label: &str) -> Config {
        let ca = dir.join("ca.pem");
        std::fs::write(&ca, pki.ca_cert_pem()).unwrap();

        let mut config = Config::default();
        config
            .hsm
            .keys
            .insert(label.to_string(), dir.join(format!("{}.key", label)));
        config.identity.trust_anchors = vec![ca.clone()];
        config
            .identities
            .insert("default".to_string(), write_client(pki, dir, label));
        config.routes.insert(
            "billing".to_string(),
            RouteConfig {
                address: upstream.to_string(),
                server_name: Some(UPSTREAM_HOST.to_string()),
                trust_anchors: vec![ca],
                ..Default::default()
            },
        );
        config
    }

    async fn body(services: &Services, hint: &str) -> Result<String, ProxyError> {
        let response = services
            .orchestrator
            .forward(ProxyRequest::new(hint, Method::GET, "/"))
            .await?;
        Ok(String::from_utf8_lossy(&response.body).to_string())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_services_from_config() {
        let pki = DevPki::generate("test CA").unwrap();
        let upstream = spawn_upstream(&pki).await;
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&pki, dir.path(), upstream.addr, "edge-client");

        let services = Services::build(&config, Arc::new(AuditLogger::new_null()))
            .await
            .unwrap();
        assert_eq!(services.router.version(), 1);
        assert_eq!(services.identities.names(), vec!["default".to_string()]);
        assert_eq!(body(&services, "billing").await.unwrap(), "GET / cn=edge-client");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_build_fails_on_untrusted_identity() {
        let pki = DevPki::generate("test CA").unwrap();
        let other = DevPki::generate("other CA").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(&pki, dir.path(), "127.0.0.1:9".parse().unwrap(), "edge-client");
        config
            .identities
            .insert("default".to_string(), write_client(&other, dir.path(), "edge-client"));

        let result = Services::build(&config, Arc::new(AuditLogger::new_null())).await;
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reload_rotates_and_swaps_routes() {
        let pki = DevPki::generate("test CA").unwrap();
        let upstream = spawn_upstream(&pki).await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(&pki, dir.path(), upstream.addr, "edge-client");
        let services = Services::build(&config, Arc::new(AuditLogger::new_null()))
            .await
            .unwrap();
        assert_eq!(body(&services, "billing").await.unwrap(), "GET / cn=edge-client");

        // Same configuration: nothing to do.
        let summary = services.reload(&config).await.unwrap();
        assert_eq!(summary, ReloadSummary::default());

        // New client material plus a second route.
        config
            .identities
            .insert("default".to_string(), write_client(&pki, dir.path(), "edge-client-2"));
        config.hsm.keys.insert(
            "edge-client-2".to_string(),
            dir.path().join("edge-client-2.key"),
        );
        let ledger = config.routes["billing"].clone();
        config.routes.insert("ledger".to_string(), ledger);

        let summary = services.reload(&config).await.unwrap();
        assert_eq!(summary.rotated, vec!["default".to_string()]);
        assert_eq!(summary.routes_version, Some(2));
        assert_eq!(body(&services, "billing").await.unwrap(), "GET / cn=edge-client-2");
        assert_eq!(body(&services, "ledger").await.unwrap(), "GET / cn=edge-client-2");

        // Dropping a route makes it unknown.
        config.routes.remove("ledger");
        services.reload(&config).await.unwrap();
        assert!(matches!(
            body(&services, "ledger").await,
            Err(ProxyError::UnknownDestination(_))
        ));
    }
}
