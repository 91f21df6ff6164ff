//! Root certificate authority for TLS interception.
//!
//! Every intercepted host gets a leaf certificate signed by one locally
//! generated root. The root material (certificate + private key) lives in
//! the state directory; operators point client trust stores at the
//! certificate file via `SSL_CERT_FILE` / `REQUESTS_CA_BUNDLE` or the
//! platform store. Provisioning is lazy: the first start generates the
//! root, later starts reuse it, and a half-missing pair is regenerated
//! whole so the cert on disk always matches the signing key.

use std::fs;
use std::path::{Path, PathBuf};

use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::rcgen::{
    BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;

pub use crate::error::CaError;

/// Subject common name on the root certificate.
const ROOT_COMMON_NAME: &str = "Tokentap Root CA";

/// Leaf certificates cached by the signing authority.
const LEAF_CACHE_SIZE: u64 = 256;

/// The on-disk root CA and the signing authority built from it.
#[derive(Debug, Clone)]
pub struct CertAuthority {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl CertAuthority {
    /// Points at (not yet necessarily existing) root material in `dir`.
    pub fn at(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            cert_path: dir.join("tokentap-ca.crt"),
            key_path: dir.join("tokentap-ca.key"),
        }
    }

    /// Root material under the default tokentap state directory.
    pub fn in_default_location() -> Result<Self, CaError> {
        let state_dir = tokentap_core::security::default_state_dir()
            .map_err(|e| CaError::Generate(e.to_string()))?;
        Ok(Self::at(state_dir.join("ca")))
    }

    /// Path of the certificate file clients must trust.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// True when both halves of the root material exist on disk.
    pub fn is_provisioned(&self) -> bool {
        self.cert_path.exists() && self.key_path.exists()
    }

    /// Returns a ready signing authority, generating root material first
    /// when any of it is missing.
    pub fn provision(&self) -> Result<RcgenAuthority, CaError> {
        if !self.is_provisioned() {
            self.generate()?;
        }

        let cert_pem = fs::read_to_string(&self.cert_path)?;
        let key_pem = fs::read_to_string(&self.key_path)?;
        let key = KeyPair::from_pem(&key_pem).map_err(|e| CaError::Invalid(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key)
            .map_err(|e| CaError::Invalid(e.to_string()))?;

        Ok(RcgenAuthority::new(issuer, LEAF_CACHE_SIZE, default_provider()))
    }

    /// The root certificate PEM, for trust-store installation.
    pub fn trust_pem(&self) -> Result<String, CaError> {
        Ok(fs::read_to_string(&self.cert_path)?)
    }

    /// Writes a fresh root key pair and self-signed certificate,
    /// replacing whatever was there.
    fn generate(&self) -> Result<(), CaError> {
        if let Some(dir) = self.cert_path.parent() {
            fs::create_dir_all(dir)?;
        }

        let key = KeyPair::generate().map_err(|e| CaError::Generate(e.to_string()))?;
        let cert = root_params()?
            .self_signed(&key)
            .map_err(|e| CaError::Generate(e.to_string()))?;

        fs::write(&self.cert_path, cert.pem())?;
        fs::write(&self.key_path, key.serialize_pem())?;

        // The key can mint certificates for arbitrary hosts.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.key_path, fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!(cert = %self.cert_path.display(), "provisioned new root CA");
        Ok(())
    }
}

/// Certificate parameters for the root: a CA cert able to sign server
/// (and client) leaves.
fn root_params() -> Result<CertificateParams, CaError> {
    let mut params = CertificateParams::new(vec![ROOT_COMMON_NAME.to_string()])
        .map_err(|e| CaError::Generate(e.to_string()))?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    Ok(params)
}
