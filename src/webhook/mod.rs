//! Mutating admission webhook
//!
//! Every registered [`Extension`](crate::Extension) is exposed on its own
//! path (`/0`, `/1`, ...) of a TLS admission server, and gets a matching
//! entry in the `MutatingWebhookConfiguration` submitted to the API server.
//!
//! - [`adapter`]: decodes the Pod and applies the app filter before an extension runs
//! - [`configuration`]: builds the webhook configuration for the API server
//! - [`patch`]: JSON patch responses from Pod states
//! - [`server`]: the axum/rustls admission server

pub mod adapter;
pub mod configuration;
pub mod patch;
pub mod server;

pub use adapter::MutatingWebhook;
pub use configuration::{build_configuration, generate_admission_webhooks};
pub use patch::{bad_request, no_op_patch, patch_from_pod};
pub use server::serve;

#[cfg(test)]
pub(crate) mod test_support {
    use k8s_openapi::api::core::v1::Pod;
    use kube::core::admission::{AdmissionRequest, AdmissionReview};
    use kube::core::DynamicObject;
    use serde_json::{json, Value};

    /// A Pod CREATE request as the API server would send it
    pub fn admission_request(object: Option<Value>) -> AdmissionRequest<DynamicObject> {
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "name": "app-0",
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": {"username": "admin"},
                "object": object,
                "dryRun": false
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    pub fn pod_request(pod: &Pod) -> AdmissionRequest<DynamicObject> {
        admission_request(Some(serde_json::to_value(pod).unwrap()))
    }
}
