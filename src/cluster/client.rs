//! `kube`-backed cluster client

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config, ResourceExt,
};
use serde_json::json;
use tracing::{debug, info};

use super::{ClusterClient, PodEventStream};
use crate::error::{Error, Result};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "eirinix";

/// Server-side timeout of a single watch request, the API server caps it
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Cluster client talking to a real API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using a kubeconfig file, or infer the configuration
    /// (in-cluster service account, then `KUBECONFIG`/`~/.kube/config`)
    pub async fn connect(kubeconfig_path: Option<&Path>) -> Result<Self> {
        let config = match kubeconfig_path {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::ConfigError(format!(
                        "failed to read kubeconfig {}: {e}",
                        path.display()
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::ConfigError(format!("invalid kubeconfig: {e}")))?
            }
            None => Config::infer()
                .await
                .map_err(|e| Error::ConfigError(format!("failed to infer kubeconfig: {e}")))?,
        };

        let client = Client::try_from(config)?;

        // Fail fast on unreachable clusters or bad credentials
        let version = client.apiserver_version().await?;
        info!(
            "Connected to Kubernetes {}.{} ({})",
            version.major, version.minor, version.git_version
        );

        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn pods(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets.get_opt(name).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let created = secrets.create(&PostParams::default(), secret).await?;
        debug!("Created secret {}/{}", namespace, created.name_any());
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        Ok(namespaces.get(name).await?)
    }

    async fn patch_namespace_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let patch = json!({
            "metadata": {
                "labels": labels
            }
        });
        namespaces
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn apply_mutating_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<()> {
        let configs: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        let name = config.name_any();
        configs
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(config),
            )
            .await?;
        Ok(())
    }

    async fn watch_pods(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
        resource_version: &str,
    ) -> Result<PodEventStream> {
        let mut params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }

        let stream = self.pods(namespace).watch(&params, resource_version).await?;
        Ok(stream.map_err(Error::from).boxed())
    }

    async fn latest_pod_resource_version(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<String> {
        let mut params = ListParams::default().limit(1);
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self.pods(namespace).list(&params).await?;
        Ok(list.metadata.resource_version.unwrap_or_default())
    }
}
