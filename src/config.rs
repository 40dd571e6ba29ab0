//! Manager configuration
//!
//! [`ManagerOptions`] carries everything the manager needs to provision the
//! webhook endpoint and watch Pods. Options can be built in code with the
//! `with_*` setters, or deserialized from YAML with camelCase keys:
//!
//! ```yaml
//! namespace: eirini
//! host: 10.0.0.12
//! port: 4443
//! failurePolicy: Ignore
//! operatorFingerprint: my-extension
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Label carried by Pods created for application workloads
pub const SOURCE_TYPE_LABEL: &str = "source_type";

/// Value of [`SOURCE_TYPE_LABEL`] marking an application Pod
pub const APP_SOURCE_TYPE: &str = "APP";

pub const DEFAULT_OPERATOR_FINGERPRINT: &str = "eirini-x";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 443;
pub const DEFAULT_CLUSTER_TIMEOUT_SECS: u64 = 10;

/// What the API server does when the webhook cannot be reached
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    Fail,
    Ignore,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Fail => write!(f, "Fail"),
            FailurePolicy::Ignore => write!(f, "Ignore"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(FailurePolicy::Fail),
            "ignore" => Ok(FailurePolicy::Ignore),
            other => Err(Error::ConfigError(format!(
                "unknown failure policy '{other}', expected Fail or Ignore"
            ))),
        }
    }
}

/// Configuration for the extension manager
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerOptions {
    /// Namespace the manager operates in; empty means all namespaces
    pub namespace: String,

    /// Host advertised in the webhook URL
    pub host: String,

    /// Port advertised in the webhook URL, also the default listen port
    pub port: u16,

    /// Socket the admission server binds (default `0.0.0.0:{port}`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<SocketAddr>,

    /// Route admission traffic through this Service instead of a URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Namespace of `service_name` (defaults to `namespace`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_namespace: Option<String>,

    /// Kubeconfig file; inferred from the environment when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig_path: Option<PathBuf>,

    pub failure_policy: Option<FailurePolicy>,

    /// Only dispatch and watch Pods labeled `source_type=APP`
    pub filter_eirini_apps: bool,

    /// Prefix of every generated resource name
    pub operator_fingerprint: String,

    /// Resource version the watch stream starts from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watcher_start_resource_version: Option<String>,

    /// Namespace selector labels overriding `{fingerprint}-ns=namespace`
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub namespace_match_labels: BTreeMap<String, String>,

    /// Name of the certificate Secret (default `{fingerprint}-setupcertificate`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_certificate_name: Option<String>,

    /// Directory receiving `tls.crt` and `tls.key`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_dir: Option<PathBuf>,

    /// Submit the webhook configuration on start
    pub register_webhooks: bool,

    /// Upper bound for each cluster round-trip during setup
    pub cluster_timeout_secs: u64,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            listen_address: None,
            service_name: None,
            webhook_namespace: None,
            kubeconfig_path: None,
            failure_policy: Some(FailurePolicy::Fail),
            filter_eirini_apps: true,
            operator_fingerprint: DEFAULT_OPERATOR_FINGERPRINT.to_string(),
            watcher_start_resource_version: None,
            namespace_match_labels: BTreeMap::new(),
            setup_certificate_name: None,
            cert_dir: None,
            register_webhooks: true,
            cluster_timeout_secs: DEFAULT_CLUSTER_TIMEOUT_SECS,
        }
    }
}

impl ManagerOptions {
    /// Load options from a YAML file, unset keys keep their defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|e| {
            Error::ConfigError(format!("invalid options file {}: {e}", path.display()))
        })
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_listen_address(mut self, addr: SocketAddr) -> Self {
        self.listen_address = Some(addr);
        self
    }

    pub fn with_service(
        mut self,
        service_name: impl Into<String>,
        webhook_namespace: impl Into<String>,
    ) -> Self {
        self.service_name = Some(service_name.into());
        self.webhook_namespace = Some(webhook_namespace.into());
        self
    }

    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig_path = Some(path.into());
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    pub fn with_filter_eirini_apps(mut self, filter: bool) -> Self {
        self.filter_eirini_apps = filter;
        self
    }

    pub fn with_operator_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.operator_fingerprint = fingerprint.into();
        self
    }

    pub fn with_watcher_start_resource_version(mut self, rv: impl Into<String>) -> Self {
        self.watcher_start_resource_version = Some(rv.into());
        self
    }

    pub fn with_namespace_match_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.namespace_match_labels = labels;
        self
    }

    pub fn with_setup_certificate_name(mut self, name: impl Into<String>) -> Self {
        self.setup_certificate_name = Some(name.into());
        self
    }

    pub fn with_cert_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cert_dir = Some(dir.into());
        self
    }

    pub fn with_register_webhooks(mut self, register: bool) -> Self {
        self.register_webhooks = register;
        self
    }

    pub fn with_cluster_timeout(mut self, timeout: Duration) -> Self {
        self.cluster_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Label key placed on the operator namespace and used by the namespace selector
    pub fn namespace_label_key(&self) -> String {
        format!("{}-ns", self.operator_fingerprint)
    }

    pub fn certificate_secret_name(&self) -> String {
        self.setup_certificate_name
            .clone()
            .unwrap_or_else(|| format!("{}-setupcertificate", self.operator_fingerprint))
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.cert_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(self.certificate_secret_name()))
    }

    /// `{fingerprint}-mutating-hook`, suffixed with the namespace when scoped
    pub fn webhook_configuration_name(&self) -> String {
        if self.namespace.is_empty() {
            format!("{}-mutating-hook", self.operator_fingerprint)
        } else {
            format!(
                "{}-mutating-hook-{}",
                self.operator_fingerprint, self.namespace
            )
        }
    }

    /// Name of the webhook entry for the extension at `index`
    pub fn webhook_name(&self, index: usize) -> String {
        format!("{}.{}.org", index, self.operator_fingerprint)
    }

    pub fn listen_address(&self) -> SocketAddr {
        self.listen_address
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], self.port)))
    }

    pub fn service_namespace(&self) -> String {
        self.webhook_namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| self.namespace.clone())
    }

    /// Service name, when admission traffic is routed through a Service
    pub fn webhook_service(&self) -> Option<&str> {
        self.service_name.as_deref().filter(|name| !name.is_empty())
    }

    /// Namespace to watch, `None` meaning all namespaces
    pub fn watch_namespace(&self) -> Option<&str> {
        Some(self.namespace.as_str()).filter(|ns| !ns.is_empty())
    }

    /// Label selector applied to the Pod watch
    pub fn watch_label_selector(&self) -> Option<String> {
        self.filter_eirini_apps
            .then(|| format!("{SOURCE_TYPE_LABEL}={APP_SOURCE_TYPE}"))
    }

    pub fn cluster_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster_timeout_secs)
    }

    /// DNS names (or IP) the webhook server certificate must be valid for
    pub fn certificate_subject_names(&self) -> Vec<String> {
        match self.webhook_service() {
            Some(service) => {
                let ns = self.service_namespace();
                vec![
                    service.to_string(),
                    format!("{service}.{ns}"),
                    format!("{service}.{ns}.svc"),
                    format!("{service}.{ns}.svc.cluster.local"),
                ]
            }
            None => vec![self.host.clone()],
        }
    }

    /// Check the invariants registration depends on
    pub fn validate(&self) -> Result<()> {
        if self.failure_policy.is_none() {
            return Err(Error::ConfigError(
                "failure policy must be set before registering webhooks".to_string(),
            ));
        }
        if self.operator_fingerprint.is_empty() {
            return Err(Error::ConfigError(
                "operator fingerprint must not be empty".to_string(),
            ));
        }
        if self.webhook_service().is_none() && self.host.is_empty() {
            return Err(Error::ConfigError(
                "either a webhook host or a service name is required".to_string(),
            ));
        }
        Ok(())
    }
}
