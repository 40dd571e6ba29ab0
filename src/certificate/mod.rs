//! Webhook certificate management
//!
//! The admission server needs a serving certificate the API server trusts.
//! A CA and a server certificate are generated once, stored in a Secret and
//! reused by every later run (and by every replica).

mod bootstrap;
mod generator;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use time::OffsetDateTime;
use x509_parser::pem::parse_x509_pem;

use crate::error::{Error, Result};

pub use bootstrap::{ensure_certificate, write_cert_files, CertificateRequest};
pub use generator::{CertificateGenerator, KeyMaterial, RcgenGenerator};

/// Secret key holding the server certificate
pub const CERTIFICATE_KEY: &str = "certificate";
/// Secret key holding the server private key
pub const PRIVATE_KEY_KEY: &str = "private_key";
/// Secret key holding the CA certificate
pub const CA_CERTIFICATE_KEY: &str = "ca_certificate";
/// Secret key holding the CA private key
pub const CA_PRIVATE_KEY_KEY: &str = "ca_private_key";

/// File name of the serving certificate in the cert dir
pub const TLS_CERT_FILE: &str = "tls.crt";
/// File name of the serving key in the cert dir
pub const TLS_KEY_FILE: &str = "tls.key";

/// The full certificate material of the webhook, PEM encoded
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
    pub ca_certificate: Vec<u8>,
    pub ca_private_key: Vec<u8>,
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("certificate", &self.certificate.len())
            .field("ca_certificate", &self.ca_certificate.len())
            .finish_non_exhaustive()
    }
}

impl CertificateBundle {
    pub fn new(server: KeyMaterial, ca: KeyMaterial) -> Self {
        Self {
            certificate: server.certificate,
            private_key: server.private_key,
            ca_certificate: ca.certificate,
            ca_private_key: ca.private_key,
        }
    }

    /// Read the bundle stored in a Secret
    ///
    /// All four keys must be present and non-empty.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        let data = secret.data.as_ref();
        let field = |key: &str| -> Result<Vec<u8>> {
            data.and_then(|d| d.get(key))
                .map(|value| value.0.clone())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    Error::ConfigError(format!(
                        "certificate secret {name} is malformed: missing or empty key '{key}'"
                    ))
                })
        };

        Ok(Self {
            certificate: field(CERTIFICATE_KEY)?,
            private_key: field(PRIVATE_KEY_KEY)?,
            ca_certificate: field(CA_CERTIFICATE_KEY)?,
            ca_private_key: field(CA_PRIVATE_KEY_KEY)?,
        })
    }

    /// Build the Secret persisting this bundle
    pub fn to_secret(&self, name: &str, namespace: &str) -> Secret {
        let data: BTreeMap<String, ByteString> = [
            (CERTIFICATE_KEY, &self.certificate),
            (PRIVATE_KEY_KEY, &self.private_key),
            (CA_CERTIFICATE_KEY, &self.ca_certificate),
            (CA_PRIVATE_KEY_KEY, &self.ca_private_key),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), ByteString(value.clone())))
        .collect();

        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    /// Expiry of the server certificate
    pub fn not_after(&self) -> Result<OffsetDateTime> {
        let (_, pem) = parse_x509_pem(&self.certificate)
            .map_err(|e| Error::CertificateError(format!("invalid certificate PEM: {e}")))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| Error::CertificateError(format!("invalid certificate: {e}")))?;
        OffsetDateTime::from_unix_timestamp(cert.validity().not_after.timestamp())
            .map_err(|e| Error::CertificateError(format!("invalid expiry: {e}")))
    }
}
