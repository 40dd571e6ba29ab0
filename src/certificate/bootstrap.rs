//! Find-or-create of the webhook certificate Secret

use std::path::{Path, PathBuf};
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use super::{CertificateBundle, CertificateGenerator, TLS_CERT_FILE, TLS_KEY_FILE};
use crate::cluster::{bounded, ClusterClient};
use crate::config::{ManagerOptions, DEFAULT_NAMESPACE};
use crate::error::{Error, Result};

/// Certificates closer than this to expiry are reported at startup
const EXPIRY_WARNING_WINDOW: time::Duration = time::Duration::days(30);

/// Where the certificate lives and what it must be valid for
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pub secret_name: String,
    pub namespace: String,
    pub subject_names: Vec<String>,
    pub cert_dir: PathBuf,
    pub timeout: Duration,
}

impl CertificateRequest {
    pub fn from_options(options: &ManagerOptions) -> Self {
        // The Secret needs a home even when watching all namespaces
        let namespace = Some(options.service_namespace())
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        Self {
            secret_name: options.certificate_secret_name(),
            namespace,
            subject_names: options.certificate_subject_names(),
            cert_dir: options.cert_dir(),
            timeout: options.cluster_timeout(),
        }
    }
}

/// Load the webhook certificate from its Secret, generating and storing it
/// on first use, then write `tls.crt`/`tls.key` into the cert dir.
///
/// Existing material is never regenerated. A Secret missing any of its keys
/// is reported as a configuration error rather than overwritten.
#[instrument(skip_all, fields(secret = %request.secret_name, namespace = %request.namespace))]
pub async fn ensure_certificate(
    cluster: &dyn ClusterClient,
    generator: &dyn CertificateGenerator,
    request: &CertificateRequest,
) -> Result<CertificateBundle> {
    let existing = bounded(
        request.timeout,
        "reading certificate secret",
        cluster.get_secret(&request.namespace, &request.secret_name),
    )
    .await?;

    let bundle = match existing {
        Some(secret) => {
            debug!("Reusing certificate from existing secret");
            CertificateBundle::from_secret(&secret)?
        }
        None => create_certificate(cluster, generator, request).await?,
    };

    warn_if_expiring(&bundle);
    write_cert_files(&request.cert_dir, &bundle).await?;

    Ok(bundle)
}

async fn create_certificate(
    cluster: &dyn ClusterClient,
    generator: &dyn CertificateGenerator,
    request: &CertificateRequest,
) -> Result<CertificateBundle> {
    info!(
        "Generating webhook certificate for {}",
        request.subject_names.join(", ")
    );

    let ca = generator.generate_ca(&format!("{}-ca", request.secret_name))?;
    let server = generator.generate_certificate(&request.subject_names, &ca)?;
    let bundle = CertificateBundle::new(server, ca);
    let secret = bundle.to_secret(&request.secret_name, &request.namespace);

    match bounded(
        request.timeout,
        "creating certificate secret",
        cluster.create_secret(&request.namespace, &secret),
    )
    .await
    {
        Ok(()) => {
            info!("Stored webhook certificate in secret");
            Ok(bundle)
        }
        Err(e) if e.is_conflict() => {
            // Another replica won the race, its material is authoritative
            info!("Certificate secret was created concurrently, using stored material");
            let stored = bounded(
                request.timeout,
                "re-reading certificate secret",
                cluster.get_secret(&request.namespace, &request.secret_name),
            )
            .await?
            .ok_or_else(|| {
                Error::CertificateError(format!(
                    "secret {} reported as existing but could not be read",
                    request.secret_name
                ))
            })?;
            CertificateBundle::from_secret(&stored)
        }
        Err(e) => Err(e),
    }
}

fn warn_if_expiring(bundle: &CertificateBundle) {
    match bundle.not_after() {
        Ok(not_after) if not_after - OffsetDateTime::now_utc() < EXPIRY_WARNING_WINDOW => {
            warn!(
                %not_after,
                "Webhook certificate expires soon, delete the secret to regenerate it"
            );
        }
        Ok(_) => {}
        Err(e) => debug!("Could not inspect certificate expiry: {}", e),
    }
}

/// Write the serving certificate and key where the admission server reads them
pub async fn write_cert_files(dir: &Path, bundle: &CertificateBundle) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(dir.join(TLS_CERT_FILE), &bundle.certificate).await?;
    tokio::fs::write(dir.join(TLS_KEY_FILE), &bundle.private_key).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(
            dir.join(TLS_KEY_FILE),
            std::fs::Permissions::from_mode(0o600),
        )
        .await?;
    }

    debug!("Wrote certificate files to {}", dir.display());
    Ok(())
}
