//! Per-extension admission adapter

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, warn};

use super::patch::{bad_request, no_op_patch};
use crate::config::{APP_SOURCE_TYPE, SOURCE_TYPE_LABEL};
use crate::extension::Extension;
use crate::manager::Manager;

/// Wraps an [`Extension`] with Pod decoding and the app filter
#[derive(Clone)]
pub struct MutatingWebhook {
    index: usize,
    name: String,
    filter_eirini_apps: bool,
    extension: Arc<dyn Extension>,
}

impl std::fmt::Debug for MutatingWebhook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatingWebhook")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("filter_eirini_apps", &self.filter_eirini_apps)
            .finish_non_exhaustive()
    }
}

impl MutatingWebhook {
    pub fn new(
        index: usize,
        name: impl Into<String>,
        filter_eirini_apps: bool,
        extension: Arc<dyn Extension>,
    ) -> Self {
        Self {
            index,
            name: name.into(),
            filter_eirini_apps,
            extension,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Webhook name as registered with the API server, `{index}.{fingerprint}.org`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// HTTP path the admission server routes to this webhook
    pub fn path(&self) -> String {
        format!("/{}", self.index)
    }

    /// Handle one admission request
    ///
    /// Requests without a decodable Pod are rejected with a 400 response.
    /// With app filtering on, Pods lacking `source_type=APP` are admitted
    /// unchanged without consulting the extension.
    pub async fn handle(
        &self,
        manager: &Manager,
        request: &AdmissionRequest<DynamicObject>,
    ) -> AdmissionResponse {
        let pod = match decode_pod(request) {
            Ok(pod) => pod,
            Err(message) => {
                warn!(webhook = %self.name, "Rejecting admission request: {}", message);
                return bad_request(request, message);
            }
        };

        if self.filter_eirini_apps && !is_eirini_app(&pod) {
            debug!(
                webhook = %self.name,
                pod = %pod.name_any(),
                "Pod is not an Eirini app, admitting unchanged"
            );
            return no_op_patch(request, &pod);
        }

        self.extension.handle(manager, &pod, request).await
    }
}

fn decode_pod(request: &AdmissionRequest<DynamicObject>) -> Result<Pod, String> {
    let object = request
        .object
        .as_ref()
        .ok_or_else(|| "admission request carries no object".to_string())?;
    serde_json::to_value(object)
        .and_then(serde_json::from_value::<Pod>)
        .map_err(|e| format!("object is not a valid Pod: {e}"))
}

/// Whether the Pod carries the `source_type=APP` label
pub fn is_eirini_app(pod: &Pod) -> bool {
    pod.labels()
        .get(SOURCE_TYPE_LABEL)
        .is_some_and(|value| value == APP_SOURCE_TYPE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerOptions;
    use crate::webhook::test_support::{admission_request, pod_request};
    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Denies every Pod so delegation is observable
    #[derive(Default)]
    struct DenyAll {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Extension for DenyAll {
        async fn handle(
            &self,
            _manager: &Manager,
            _pod: &Pod,
            request: &AdmissionRequest<DynamicObject>,
        ) -> AdmissionResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            AdmissionResponse::from(request).deny("denied by extension")
        }
    }

    fn pod_with_labels(labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("app-0".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn webhook(filter: bool) -> (MutatingWebhook, Arc<DenyAll>) {
        let extension = Arc::new(DenyAll::default());
        let webhook = MutatingWebhook::new(0, "0.eirini-x.org", filter, extension.clone());
        (webhook, extension)
    }

    #[tokio::test]
    async fn test_app_pod_is_delegated() {
        let manager = Manager::new(ManagerOptions::default());
        let (webhook, extension) = webhook(true);
        let request = pod_request(&pod_with_labels(&[("source_type", "APP")]));

        let response = webhook.handle(&manager, &request).await;

        assert!(!response.allowed);
        assert_eq!(response.result.message, "denied by extension");
        assert_eq!(extension.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_app_pod_gets_empty_patch() {
        let manager = Manager::new(ManagerOptions::default());
        let (webhook, extension) = webhook(true);
        let request = pod_request(&pod_with_labels(&[("source_type", "STG")]));

        let response = webhook.handle(&manager, &request).await;

        assert!(response.allowed);
        let patch: serde_json::Value =
            serde_json::from_slice(response.patch.as_ref().unwrap()).unwrap();
        assert_eq!(patch, json!([]));
        assert_eq!(extension.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_filter_disabled_delegates_everything() {
        let manager = Manager::new(ManagerOptions::default());
        let (webhook, extension) = webhook(false);
        let request = pod_request(&pod_with_labels(&[]));

        let response = webhook.handle(&manager, &request).await;

        assert!(!response.allowed);
        assert_eq!(extension.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_object_is_bad_request() {
        let manager = Manager::new(ManagerOptions::default());
        let (webhook, extension) = webhook(true);
        let request = admission_request(None);

        let response = webhook.handle(&manager, &request).await;

        assert!(!response.allowed);
        assert_eq!(response.result.code, 400);
        assert_eq!(extension.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_undecodable_pod_is_bad_request() {
        let manager = Manager::new(ManagerOptions::default());
        let (webhook, _) = webhook(false);
        let request = admission_request(Some(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "broken"},
            "spec": {"containers": "not-a-list"}
        })));

        let response = webhook.handle(&manager, &request).await;

        assert!(!response.allowed);
        assert_eq!(response.result.code, 400);
        assert!(response.result.message.contains("not a valid Pod"));
    }

    #[test]
    fn test_paths_follow_index() {
        let (webhook, _) = webhook(true);
        assert_eq!(webhook.path(), "/0");
        assert_eq!(webhook.name(), "0.eirini-x.org");
        assert_eq!(webhook.index(), 0);
    }
}
