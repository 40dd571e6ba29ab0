//! Cluster access
//!
//! Everything the manager needs from the API server goes through the
//! [`ClusterClient`] trait, so setup and the watch loop can run against any
//! backend. [`KubeCluster`] is the production implementation on top of a
//! `kube::Client`.

mod client;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use kube::api::WatchEvent;

use crate::error::{Error, Result};

pub use client::{KubeCluster, FIELD_MANAGER};

/// Stream of raw Pod watch events as sent by the API server
pub type PodEventStream = BoxStream<'static, Result<WatchEvent<Pod>>>;

/// Cluster operations used by the extension manager
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a Secret, `None` when it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create a Secret, failing with a conflict if it already exists
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;

    async fn get_namespace(&self, name: &str) -> Result<Namespace>;

    /// Merge the given labels into a namespace
    async fn patch_namespace_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Create or update a mutating webhook configuration
    async fn apply_mutating_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<()>;

    /// Open a Pod watch starting after `resource_version`
    ///
    /// An empty resource version starts from the most recent state. The
    /// returned stream ends when the server closes the connection.
    async fn watch_pods(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
        resource_version: &str,
    ) -> Result<PodEventStream>;

    /// Current resource version of the Pod collection
    async fn latest_pod_resource_version(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<String>;
}

/// Run a cluster round-trip, failing with [`Error::Timeout`] once `timeout` elapses
pub async fn bounded<T, F>(timeout: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!("{operation} ({}s)", timeout.as_secs()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let value = bounded(Duration::from_secs(1), "noop", async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let err = bounded(Duration::from_secs(10), "reading secret", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Timeout(ref msg) if msg == "reading secret (10s)"));
    }
}
