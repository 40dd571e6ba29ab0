//! Admission responses built from Pod states

use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::DynamicObject;
use tracing::error;

/// Respond with the JSON patch turning `original` into `mutated`
///
/// Identical Pods produce an empty patch, which admits the object unchanged.
pub fn patch_from_pod(
    request: &AdmissionRequest<DynamicObject>,
    original: &Pod,
    mutated: &Pod,
) -> AdmissionResponse {
    let (before, after) = match (serde_json::to_value(original), serde_json::to_value(mutated)) {
        (Ok(before), Ok(after)) => (before, after),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to serialize pod for patching: {}", e);
            return internal_error(request, format!("failed to serialize pod: {e}"));
        }
    };

    let patch = json_patch::diff(&before, &after);
    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to serialize JSON patch: {}", e);
            internal_error(request, format!("failed to serialize patch: {e}"))
        }
    }
}

/// Admit the Pod with an empty patch
pub fn no_op_patch(request: &AdmissionRequest<DynamicObject>, pod: &Pod) -> AdmissionResponse {
    patch_from_pod(request, pod, pod)
}

/// Reject a request whose object could not be decoded
pub fn bad_request(
    request: &AdmissionRequest<DynamicObject>,
    message: impl Into<String>,
) -> AdmissionResponse {
    failure(request, 400, "BadRequest", message.into())
}

fn internal_error(request: &AdmissionRequest<DynamicObject>, message: String) -> AdmissionResponse {
    failure(request, 500, "InternalError", message)
}

fn failure(
    request: &AdmissionRequest<DynamicObject>,
    code: u16,
    reason: &str,
    message: String,
) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request).deny(message);
    response.result.code = code;
    response.result.reason = reason.to_string();
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::test_support::{admission_request, pod_request};
    use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec};
    use serde_json::{json, Value};

    fn pod() -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn patch_ops(response: &AdmissionResponse) -> Value {
        serde_json::from_slice(response.patch.as_ref().unwrap()).unwrap()
    }

    #[test]
    fn test_identical_pods_produce_empty_patch() {
        let request = pod_request(&pod());
        let response = no_op_patch(&request, &pod());

        assert!(response.allowed);
        assert_eq!(patch_ops(&response), json!([]));
    }

    #[test]
    fn test_patch_adds_env_var() {
        let original = pod();
        let request = pod_request(&original);
        let mut mutated = original.clone();
        mutated.spec.as_mut().unwrap().containers[0].env = Some(vec![EnvVar {
            name: "STICKY_MESSAGE".to_string(),
            value: Some("hello".to_string()),
            ..Default::default()
        }]);

        let response = patch_from_pod(&request, &original, &mutated);

        assert!(response.allowed);
        assert_eq!(
            patch_ops(&response),
            json!([{
                "op": "add",
                "path": "/spec/containers/0/env",
                "value": [{"name": "STICKY_MESSAGE", "value": "hello"}]
            }])
        );
    }

    #[test]
    fn test_bad_request_is_denied_with_400() {
        let request = admission_request(None);
        let response = bad_request(&request, "no pod in request");

        assert!(!response.allowed);
        assert_eq!(response.result.code, 400);
        assert_eq!(response.result.reason, "BadRequest");
        assert_eq!(response.result.message, "no pod in request");
        assert_eq!(response.uid, request.uid);
    }
}
