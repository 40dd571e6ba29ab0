//! MutatingWebhookConfiguration generation

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook as WebhookEntry, MutatingWebhookConfiguration, RuleWithOperations,
    ServiceReference, WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;

use crate::config::ManagerOptions;
use crate::error::{Error, Result};

fn strings(values: &[&str]) -> Option<Vec<String>> {
    Some(values.iter().map(|v| v.to_string()).collect())
}

/// Rule intercepting Pod creation and update in every scope
fn pod_rule() -> RuleWithOperations {
    RuleWithOperations {
        api_groups: strings(&[""]),
        api_versions: strings(&["v1"]),
        resources: strings(&["pods"]),
        operations: strings(&["CREATE", "UPDATE"]),
        scope: Some("*".to_string()),
    }
}

fn namespace_selector(options: &ManagerOptions) -> Option<LabelSelector> {
    let match_labels = if !options.namespace_match_labels.is_empty() {
        options.namespace_match_labels.clone()
    } else if !options.namespace.is_empty() {
        BTreeMap::from([(options.namespace_label_key(), options.namespace.clone())])
    } else {
        return None;
    };

    Some(LabelSelector {
        match_labels: Some(match_labels),
        ..Default::default()
    })
}

fn client_config(options: &ManagerOptions, index: usize, ca_bundle: &[u8]) -> WebhookClientConfig {
    let path = format!("/{index}");
    let ca_bundle = Some(ByteString(ca_bundle.to_vec()));

    match options.webhook_service() {
        Some(service) => WebhookClientConfig {
            service: Some(ServiceReference {
                name: service.to_string(),
                namespace: options.service_namespace(),
                path: Some(path),
                port: None,
            }),
            url: None,
            ca_bundle,
        },
        None => WebhookClientConfig {
            url: Some(format!("https://{}:{}{}", options.host, options.port, path)),
            service: None,
            ca_bundle,
        },
    }
}

/// One webhook entry per extension, in registration order
///
/// Entry `i` is named `{i}.{fingerprint}.org` and points at path `/{i}`,
/// either on `https://{host}:{port}` or on the configured Service.
pub fn generate_admission_webhooks(
    count: usize,
    options: &ManagerOptions,
    ca_bundle: &[u8],
) -> Result<Vec<WebhookEntry>> {
    options.validate()?;
    let failure_policy = options
        .failure_policy
        .ok_or_else(|| Error::ConfigError("failure policy is not set".to_string()))?;

    Ok((0..count)
        .map(|index| WebhookEntry {
            name: options.webhook_name(index),
            admission_review_versions: vec!["v1".to_string()],
            client_config: client_config(options, index, ca_bundle),
            failure_policy: Some(failure_policy.to_string()),
            namespace_selector: namespace_selector(options),
            rules: Some(vec![pod_rule()]),
            side_effects: "None".to_string(),
            ..Default::default()
        })
        .collect())
}

/// The configuration object submitted to the API server
pub fn build_configuration(
    options: &ManagerOptions,
    webhooks: Vec<WebhookEntry>,
) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(options.webhook_configuration_name()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_string(),
                options.operator_fingerprint.clone(),
            )])),
            ..Default::default()
        },
        webhooks: Some(webhooks),
    }
}
