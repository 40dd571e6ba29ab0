//! CA and server certificate generation with rcgen

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use time::{Duration, OffsetDateTime};

use crate::error::{Error, Result};

/// A PEM encoded certificate and its private key
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("certificate", &String::from_utf8_lossy(&self.certificate))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Produces the CA and the serving certificate for the admission webhook
pub trait CertificateGenerator: Send + Sync {
    /// Create a self-signed certificate authority
    fn generate_ca(&self, common_name: &str) -> Result<KeyMaterial>;

    /// Create a server certificate for `subject_names`, signed by `ca`
    ///
    /// Names that parse as IP addresses become IP SANs, everything else a DNS SAN.
    fn generate_certificate(&self, subject_names: &[String], ca: &KeyMaterial)
        -> Result<KeyMaterial>;
}

/// Default generator backed by `rcgen`
#[derive(Debug, Clone)]
pub struct RcgenGenerator {
    ca_validity: Duration,
    certificate_validity: Duration,
}

impl Default for RcgenGenerator {
    fn default() -> Self {
        Self {
            ca_validity: Duration::days(3650),
            certificate_validity: Duration::days(365),
        }
    }
}

impl RcgenGenerator {
    pub fn with_certificate_validity(mut self, validity: Duration) -> Self {
        self.certificate_validity = validity;
        self
    }
}

fn cert_error(context: &str) -> impl FnOnce(rcgen::Error) -> Error + '_ {
    move |e| Error::CertificateError(format!("{context}: {e}"))
}

fn validity_window(params: &mut CertificateParams, validity: Duration) {
    let now = OffsetDateTime::now_utc();
    // Tolerate clock skew between the operator and the API server
    params.not_before = now - Duration::hours(1);
    params.not_after = now + validity;
}

impl CertificateGenerator for RcgenGenerator {
    fn generate_ca(&self, common_name: &str) -> Result<KeyMaterial> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.key_usages.push(KeyUsagePurpose::DigitalSignature);
        params.key_usages.push(KeyUsagePurpose::KeyCertSign);
        params.key_usages.push(KeyUsagePurpose::CrlSign);
        validity_window(&mut params, self.ca_validity);

        let key = KeyPair::generate().map_err(cert_error("generating CA key"))?;
        let cert = params
            .self_signed(&key)
            .map_err(cert_error("self-signing CA"))?;

        Ok(KeyMaterial {
            certificate: cert.pem().into_bytes(),
            private_key: key.serialize_pem().into_bytes(),
        })
    }

    fn generate_certificate(
        &self,
        subject_names: &[String],
        ca: &KeyMaterial,
    ) -> Result<KeyMaterial> {
        let Some(common_name) = subject_names.first() else {
            return Err(Error::CertificateError(
                "at least one subject name is required".to_string(),
            ));
        };

        let ca_cert_pem = std::str::from_utf8(&ca.certificate)
            .map_err(|e| Error::CertificateError(format!("CA certificate is not UTF-8: {e}")))?;
        let ca_key_pem = std::str::from_utf8(&ca.private_key)
            .map_err(|e| Error::CertificateError(format!("CA key is not UTF-8: {e}")))?;

        let ca_key = KeyPair::from_pem(ca_key_pem).map_err(cert_error("loading CA key"))?;
        let ca_params =
            CertificateParams::from_ca_cert_pem(ca_cert_pem).map_err(cert_error("loading CA"))?;
        let issuer = ca_params
            .self_signed(&ca_key)
            .map_err(cert_error("rebuilding CA issuer"))?;

        let mut params = CertificateParams::new(subject_names.to_vec())
            .map_err(cert_error("invalid subject name"))?;
        params
            .distinguished_name
            .push(DnType::CommonName, common_name.as_str());
        params.key_usages.push(KeyUsagePurpose::DigitalSignature);
        params.key_usages.push(KeyUsagePurpose::KeyEncipherment);
        params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ServerAuth);
        validity_window(&mut params, self.certificate_validity);

        let key = KeyPair::generate().map_err(cert_error("generating server key"))?;
        let cert = params
            .signed_by(&key, &issuer, &ca_key)
            .map_err(cert_error("signing server certificate"))?;

        Ok(KeyMaterial {
            certificate: cert.pem().into_bytes(),
            private_key: key.serialize_pem().into_bytes(),
        })
    }
}
