//! Throwaway PKI for development and tests.
//!
//! Generates a CA, a server certificate for a local mTLS upstream and a
//! client identity whose P-256 key can be imported into the software key
//! store. Nothing here is meant for production trust.
//!
//! # Example
//!
//! ```ignore
//! use hsm_egress::identity::DevPki;
//!
//! let pki = DevPki::generate("hsm-egress dev CA")?;
//! let files = pki.write_bundle(Path::new("./pki"), "edge-client", "localhost")?;
//! println!("CA at {:?}", files.ca_cert);
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use rustls::RootCertStore;
use rustls_pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use super::error::DevPkiError;

/// Validity of generated CA and server certificates.
const DEV_VALIDITY_DAYS: i64 = 30;

/// A development certificate authority.
pub struct DevPki {
    ca_key_pair: KeyPair,
    ca_params: CertificateParams,
    ca_cert_der: CertificateDer<'static>,
    ca_cert_pem: String,
}

/// A certificate issued by [`DevPki`] together with its private key.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    /// Leaf followed by the CA certificate.
    pub chain: Vec<CertificateDer<'static>>,
    /// PEM encoding of `chain`.
    pub chain_pem: String,
    /// PKCS#8 DER private key.
    pub key_pkcs8_der: Vec<u8>,
    /// PKCS#8 PEM private key.
    pub key_pem: String,
}

/// Paths written by [`DevPki::write_bundle`].
#[derive(Debug, Clone)]
pub struct DevPkiFiles {
    /// CA certificate.
    pub ca_cert: PathBuf,
    /// Server chain.
    pub server_cert: PathBuf,
    /// Server key (0600).
    pub server_key: PathBuf,
    /// Client chain.
    pub client_cert: PathBuf,
    /// Client key (0600).
    pub client_key: PathBuf,
}

impl DevPki {
    /// Generate a new CA with the given common name.
    pub fn generate(common_name: &str) -> Result<Self, DevPkiError> {
        info!("Generating development CA '{}'", common_name);

        let ca_key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| DevPkiError::KeyGeneration(e.to_string()))?;

        let mut ca_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("hsm-egress".to_string()),
        );
        ca_params.distinguished_name = dn;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        ca_params.not_before = now - Duration::days(1);
        ca_params.not_after = now + Duration::days(DEV_VALIDITY_DAYS);

        let ca_cert = ca_params
            .clone()
            .self_signed(&ca_key_pair)
            .map_err(|e| DevPkiError::CertGeneration(e.to_string()))?;

        Ok(Self {
            ca_cert_der: ca_cert.der().clone(),
            ca_cert_pem: ca_cert.pem(),
            ca_key_pair,
            ca_params,
        })
    }

    /// CA certificate in DER.
    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    /// CA certificate in PEM.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Root store containing only this CA.
    pub fn root_store(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        // A freshly generated CA certificate always parses as a trust anchor.
        let _ = roots.add(self.ca_cert_der.clone());
        roots
    }

    /// Issue a server certificate for `hosts` (DNS names or IP addresses).
    pub fn issue_server(&self, hosts: &[&str]) -> Result<IssuedCert, DevPkiError> {
        if hosts.is_empty() {
            return Err(DevPkiError::NoHosts);
        }
        debug!("Issuing development server certificate for {:?}", hosts);

        let names: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
        let mut params = CertificateParams::new(names)
            .map_err(|e| DevPkiError::CertGeneration(e.to_string()))?;
        params.distinguished_name = common_name(hosts[0]);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(DEV_VALIDITY_DAYS);

        self.sign(params)
    }

    /// Issue a client certificate valid between the given instants.
    pub fn issue_client(
        &self,
        name: &str,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<IssuedCert, DevPkiError> {
        debug!(
            "Issuing development client certificate '{}' valid {} .. {}",
            name, not_before, not_after
        );

        let mut params = CertificateParams::default();
        params.distinguished_name = common_name(name);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after)?;

        self.sign(params)
    }

    /// Write CA, server and client material into `dir`.
    ///
    /// Keys are written with 0600 permissions.
    pub fn write_bundle(
        &self,
        dir: &Path,
        client_name: &str,
        server_host: &str,
    ) -> Result<DevPkiFiles, DevPkiError> {
        fs::create_dir_all(dir).map_err(|source| DevPkiError::Write {
            path: dir.to_path_buf(),
            source,
        })?;

        let now = Utc::now();
        let server = self.issue_server(&[server_host])?;
        let client = self.issue_client(
            client_name,
            now - chrono::Duration::minutes(5),
            now + chrono::Duration::days(DEV_VALIDITY_DAYS),
        )?;

        let files = DevPkiFiles {
            ca_cert: dir.join("ca.pem"),
            server_cert: dir.join("server.pem"),
            server_key: dir.join("server.key"),
            client_cert: dir.join("client.pem"),
            client_key: dir.join("client.key"),
        };

        write_file(&files.ca_cert, &self.ca_cert_pem, 0o644)?;
        write_file(&files.server_cert, &server.chain_pem, 0o644)?;
        write_file(&files.server_key, &server.key_pem, 0o600)?;
        write_file(&files.client_cert, &client.chain_pem, 0o644)?;
        write_file(&files.client_key, &client.key_pem, 0o600)?;

        info!("Development PKI written to {:?}", dir);
        Ok(files)
    }

    fn sign(&self, params: CertificateParams) -> Result<IssuedCert, DevPkiError> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| DevPkiError::KeyGeneration(e.to_string()))?;
        let issuer = Issuer::from_params(&self.ca_params, &self.ca_key_pair);
        let cert = params
            .signed_by(&key_pair, &issuer)
            .map_err(|e| DevPkiError::CertGeneration(e.to_string()))?;

        Ok(IssuedCert {
            chain: vec![cert.der().clone(), self.ca_cert_der.clone()],
            chain_pem: format!("{}{}", cert.pem(), self.ca_cert_pem),
            key_pkcs8_der: key_pair.serialize_der(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

fn common_name(cn: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
    dn
}

fn to_offset(instant: DateTime<Utc>) -> Result<OffsetDateTime, DevPkiError> {
    OffsetDateTime::from_unix_timestamp(instant.timestamp())
        .map_err(|e| DevPkiError::CertGeneration(format!("validity out of range: {}", e)))
}

fn write_file(path: &Path, content: &str, mode: u32) -> Result<(), DevPkiError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(|source| DevPkiError::Write {
            path: path.to_path_buf(),
            source,
        })?;

    file.write_all(content.as_bytes())
        .map_err(|source| DevPkiError::Write {
            path: path.to_path_buf(),
            source,
        })
}
