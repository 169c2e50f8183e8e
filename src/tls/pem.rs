//! PEM and trust-anchor loading.

use std::fs;
use std::path::{Path, PathBuf};

use rustls::RootCertStore;
use rustls_pki_types::CertificateDer;
use tracing::debug;

use super::error::TlsError;

/// Read every certificate in a PEM file.
pub fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = fs::read(path).map_err(|e| TlsError::Pem {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Pem {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(TlsError::Pem {
            path: path.to_path_buf(),
            message: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

/// Build a root store from PEM files.
pub fn read_root_store(paths: &[PathBuf]) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for path in paths {
        for cert in read_certs(path)? {
            roots.add(cert).map_err(|e| TlsError::Pem {
                path: path.clone(),
                message: format!("not a usable trust anchor: {}", e),
            })?;
        }
    }
    debug!("Loaded {} trust anchors from {} files", roots.len(), paths.len());
    Ok(roots)
}

/// Build a root store from the platform's native certificates.
pub fn system_roots() -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();

    // Log any errors but continue with successfully loaded certs
    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }
    for cert in native_certs.certs {
        if let Err(e) = roots.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if roots.is_empty() {
        return Err(TlsError::Config(
            "No system root certificates found".into(),
        ));
    }
    debug!("Loaded {} system root certificates", roots.len());
    Ok(roots)
}
