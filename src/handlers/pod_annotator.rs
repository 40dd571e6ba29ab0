//! Reconciler annotating application Pods

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::extension::Reconciler;
use crate::manager::Manager;

/// Ensures every watched Pod carries `key=value` as an annotation
#[derive(Debug, Clone)]
pub struct PodAnnotationReconciler {
    key: String,
    value: String,
}

impl Default for PodAnnotationReconciler {
    fn default() -> Self {
        Self::new("touched", "yes")
    }
}

/// Shared state for the annotation controller
struct AnnotatorContext {
    client: Client,
    key: String,
    value: String,
}

impl PodAnnotationReconciler {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether the Pod already carries the annotation
    pub fn is_annotated(&self, pod: &Pod) -> bool {
        has_annotation(pod, &self.key, &self.value)
    }
}

#[async_trait]
impl Reconciler for PodAnnotationReconciler {
    async fn register(&self, manager: &Manager) -> Result<()> {
        let client = manager.kube_client().await?;
        let options = manager.options();

        let pods: Api<Pod> = match options.watch_namespace() {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        let mut config = Config::default();
        if let Some(selector) = options.watch_label_selector() {
            config = config.labels(&selector);
        }

        let context = Arc::new(AnnotatorContext {
            client,
            key: self.key.clone(),
            value: self.value.clone(),
        });
        let shutdown = manager.cancellation_token();

        info!("Starting pod annotation controller ({}={})", self.key, self.value);

        tokio::spawn(async move {
            let controller = Controller::new(pods, config)
                .run(reconcile, error_policy, context)
                .for_each(|res| async move {
                    match res {
                        Ok((pod, _)) => debug!("Reconciled pod {}", pod.name),
                        Err(e) => warn!("Pod annotation reconcile failed: {}", e),
                    }
                });

            tokio::select! {
                _ = controller => {}
                _ = shutdown.cancelled() => info!("Pod annotation controller stopped"),
            }
        });

        Ok(())
    }
}

fn has_annotation(pod: &Pod, key: &str, value: &str) -> bool {
    pod.annotations().get(key).map(String::as_str) == Some(value)
}

async fn reconcile(pod: Arc<Pod>, ctx: Arc<AnnotatorContext>) -> Result<Action> {
    if has_annotation(&pod, &ctx.key, &ctx.value) {
        return Ok(Action::await_change());
    }

    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let annotations = BTreeMap::from([(ctx.key.clone(), ctx.value.clone())]);
    let patch = json!({
        "metadata": {
            "annotations": annotations
        }
    });

    pods.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::KubeError)?;
    info!("Annotated pod {}/{}", namespace, name);

    Ok(Action::await_change())
}

fn error_policy(pod: Arc<Pod>, error: &Error, _ctx: Arc<AnnotatorContext>) -> Action {
    error!("Failed to annotate pod {}: {}", pod.name_any(), error);

    // Deleted pods will never succeed
    if error.is_not_found() {
        Action::await_change()
    } else {
        Action::requeue(Duration::from_secs(15))
    }
}
