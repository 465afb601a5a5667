//! TLS certificate material for lab wildcard names
//!
//! A provider hands out a `(certificate, key)` path pair per lab. The self-signed
//! provider generates one wildcard certificate (`*.{lab}.{domain}`) the first time a
//! lab needs it and reuses the files for every student afterwards.

use crate::route::validate_token;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

const RSA_KEY_BITS: u32 = 2048;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("unknown certificate provider {0:?} (expected \"none\" or \"self-signed\")")]
    UnknownProvider(String),

    #[error("invalid lab id for certificate: {0:?}")]
    InvalidLabId(String),

    #[error("failed to generate key: {0}")]
    KeyGeneration(#[from] openssl::error::ErrorStack),

    #[error("failed to build certificate: {0}")]
    Build(#[from] rcgen::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Which provider to use, resolved once from configuration
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(try_from = "String")]
pub enum CertProviderKind {
    /// No TLS: routes listen on plain HTTP only
    #[default]
    None,
    /// Per-lab self-signed wildcard certificates
    SelfSigned,
}

impl FromStr for CertProviderKind {
    type Err = CertificateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "none" => Ok(CertProviderKind::None),
            "self-signed" => Ok(CertProviderKind::SelfSigned),
            _ => Err(CertificateError::UnknownProvider(s.to_string())),
        }
    }
}

impl TryFrom<String> for CertProviderKind {
    type Error = CertificateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for CertProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertProviderKind::None => f.write_str("none"),
            CertProviderKind::SelfSigned => f.write_str("self-signed"),
        }
    }
}

/// Paths to a certificate and its private key. Always handed out together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Certificate provider selected at startup
#[derive(Debug, Clone)]
pub enum CertificateProvider {
    None,
    SelfSigned(SelfSignedProvider),
}

impl CertificateProvider {
    /// True when routes on port 443 should terminate TLS
    pub fn is_enabled(&self) -> bool {
        matches!(self, CertificateProvider::SelfSigned(_))
    }

    pub fn kind(&self) -> CertProviderKind {
        match self {
            CertificateProvider::None => CertProviderKind::None,
            CertificateProvider::SelfSigned(_) => CertProviderKind::SelfSigned,
        }
    }

    /// Listen ports for a route that does not ask for specific ones
    pub fn default_listen_ports(&self) -> Vec<u16> {
        if self.is_enabled() {
            vec![443, 80]
        } else {
            vec![80]
        }
    }

    /// Make sure material for `lab_id` exists on disk
    pub fn generate(&self, lab_id: &str) -> Result<(), CertificateError> {
        match self {
            CertificateProvider::None => Ok(()),
            CertificateProvider::SelfSigned(provider) => provider.ensure(lab_id).map(|_| ()),
        }
    }

    /// Certificate and key for `lab_id`, generating them if needed.
    /// `None` when TLS is not configured.
    pub fn get_paths(&self, lab_id: &str) -> Result<Option<CertificatePaths>, CertificateError> {
        match self {
            CertificateProvider::None => Ok(None),
            CertificateProvider::SelfSigned(provider) => provider.ensure(lab_id).map(Some),
        }
    }
}

/// Generates RSA-2048 self-signed wildcard certificates into a directory
#[derive(Debug, Clone)]
pub struct SelfSignedProvider {
    cert_dir: PathBuf,
    domain: String,
    organization: String,
    validity_days: i64,
}

impl SelfSignedProvider {
    pub fn new(cert_dir: impl Into<PathBuf>, domain: impl Into<String>) -> Self {
        Self {
            cert_dir: cert_dir.into(),
            domain: domain.into(),
            organization: "labgate".to_string(),
            validity_days: 365,
        }
    }

    /// Set the subject organization (builder pattern)
    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = organization.into();
        self
    }

    /// Set the validity window in days (builder pattern)
    pub fn with_validity_days(mut self, days: i64) -> Self {
        self.validity_days = days;
        self
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    /// Where the material for `lab_id` lives, whether or not it exists yet
    pub fn paths_for(&self, lab_id: &str) -> Result<CertificatePaths, CertificateError> {
        validate_token("lab_id", lab_id)
            .map_err(|_| CertificateError::InvalidLabId(lab_id.to_string()))?;
        Ok(CertificatePaths {
            cert: self.cert_dir.join(format!("{}.crt", lab_id)),
            key: self.cert_dir.join(format!("{}.key", lab_id)),
        })
    }

    /// Generate material unless both files are already present.
    /// A lone certificate or key is never trusted; both get regenerated.
    pub fn ensure(&self, lab_id: &str) -> Result<CertificatePaths, CertificateError> {
        let paths = self.paths_for(lab_id)?;
        let cert_exists = paths.cert.exists();
        let key_exists = paths.key.exists();

        if cert_exists && key_exists {
            debug!(lab = lab_id, cert = %paths.cert.display(), "Reusing certificate");
            return Ok(paths);
        }
        if cert_exists || key_exists {
            warn!(
                lab = lab_id,
                cert_exists,
                key_exists,
                "Certificate pair incomplete, regenerating both files"
            );
        }

        self.generate(lab_id, &paths)?;
        Ok(paths)
    }

    fn generate(&self, lab_id: &str, paths: &CertificatePaths) -> Result<(), CertificateError> {
        let common_name = format!("*.{}.{}", lab_id, self.domain);

        let rsa = openssl::rsa::Rsa::generate(RSA_KEY_BITS)?;
        let private_key = openssl::pkey::PKey::from_rsa(rsa)?;
        let pkcs8 = private_key.private_key_to_pem_pkcs8()?;
        let key_pair = KeyPair::from_pem(&String::from_utf8_lossy(&pkcs8))?;

        let mut params = CertificateParams::new(vec![common_name.clone()])?;
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, common_name.as_str());
        distinguished_name.push(DnType::OrganizationName, self.organization.as_str());
        params.distinguished_name = distinguished_name;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(self.validity_days);

        let cert = params.self_signed(&key_pair)?;

        std::fs::create_dir_all(&self.cert_dir).map_err(|source| CertificateError::Write {
            path: self.cert_dir.clone(),
            source,
        })?;
        write_key(&paths.key, &key_pair.serialize_pem())?;
        std::fs::write(&paths.cert, cert.pem()).map_err(|source| CertificateError::Write {
            path: paths.cert.clone(),
            source,
        })?;

        info!(
            lab = lab_id,
            common_name = %common_name,
            cert = %paths.cert.display(),
            "Generated self-signed certificate"
        );
        Ok(())
    }
}

fn write_key(path: &Path, pem: &str) -> Result<(), CertificateError> {
    write_private(path, pem).map_err(|source| CertificateError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Private keys are written owner-only
#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)
}
