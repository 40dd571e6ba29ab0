//! In-memory cluster and fixtures shared by the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eirinix::certificate::{CertificateGenerator, KeyMaterial, RcgenGenerator};
use eirinix::cluster::{ClusterClient, PodEventStream};
use eirinix::{Error, Result};
use futures::stream::{self, StreamExt};
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::WatchEvent;
use kube::core::admission::{AdmissionRequest, AdmissionReview};
use kube::core::DynamicObject;
use kube::ResourceExt;
use serde_json::json;

/// One scripted answer to a `watch_pods` call
pub enum ScriptedWatch {
    /// The watch request itself fails with this API status code
    Fail(u16),
    /// The stream yields these items, then ends or stays open
    Events {
        items: Vec<Result<WatchEvent<Pod>>>,
        keep_open: bool,
    },
}

/// Arguments of a `watch_pods` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchCall {
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub resource_version: String,
}

#[derive(Default)]
struct State {
    secrets: BTreeMap<(String, String), Secret>,
    namespaces: BTreeMap<String, Namespace>,
    configurations: Vec<MutatingWebhookConfiguration>,
    watches: VecDeque<ScriptedWatch>,
    watch_calls: Vec<WatchCall>,
    latest_resource_version: String,
    namespace_patches: usize,
    create_secret_calls: usize,
    /// Stored and reported as a conflict on the next secret creation
    racing_secret: Option<Secret>,
    fail_apply: Option<u16>,
    hang_namespace_reads: bool,
}

/// Cluster backed by in-memory maps with scripted watch streams
///
/// Once the scripted watches are used up, further watches stay open
/// without events.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_namespace(&self, name: &str) {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.state().namespaces.insert(name.to_string(), namespace);
    }

    pub fn namespace_labels(&self, name: &str) -> BTreeMap<String, String> {
        self.state()
            .namespaces
            .get(name)
            .map(|ns| ns.labels().clone())
            .unwrap_or_default()
    }

    pub fn namespace_patches(&self) -> usize {
        self.state().namespace_patches
    }

    pub fn insert_secret(&self, namespace: &str, secret: Secret) {
        let key = (namespace.to_string(), secret.name_any());
        self.state().secrets.insert(key, secret);
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn create_secret_calls(&self) -> usize {
        self.state().create_secret_calls
    }

    /// Simulate another replica creating `secret` right before us
    pub fn race_secret_creation(&self, secret: Secret) {
        self.state().racing_secret = Some(secret);
    }

    /// Namespace reads never complete, holding a manager in startup
    pub fn hang_namespace_reads(&self) {
        self.state().hang_namespace_reads = true;
    }

    pub fn fail_apply(&self, code: u16) {
        self.state().fail_apply = Some(code);
    }

    pub fn configurations(&self) -> Vec<MutatingWebhookConfiguration> {
        self.state().configurations.clone()
    }

    pub fn script_watch(&self, watch: ScriptedWatch) {
        self.state().watches.push_back(watch);
    }

    pub fn set_latest_resource_version(&self, resource_version: &str) {
        self.state().latest_resource_version = resource_version.to_string();
    }

    pub fn watch_calls(&self) -> Vec<WatchCall> {
        self.state().watch_calls.clone()
    }

    /// Wait until `watch_pods` was called at least `count` times
    pub async fn wait_for_watch_calls(&self, count: usize) {
        for _ in 0..1000 {
            if self.state().watch_calls.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {count} watch calls, saw {}",
            self.state().watch_calls.len()
        );
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secret(namespace, name))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let mut state = self.state();
        state.create_secret_calls += 1;
        let key = (namespace.to_string(), secret.name_any());

        if let Some(winner) = state.racing_secret.take() {
            state.secrets.insert(key, winner);
            return Err(Error::api(409, "AlreadyExists"));
        }
        if state.secrets.contains_key(&key) {
            return Err(Error::api(409, "AlreadyExists"));
        }
        state.secrets.insert(key, secret.clone());
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace> {
        let hang = self.state().hang_namespace_reads;
        if hang {
            std::future::pending::<()>().await;
        }
        self.state()
            .namespaces
            .get(name)
            .cloned()
            .ok_or_else(|| Error::api(404, "NotFound"))
    }

    async fn patch_namespace_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state();
        state.namespace_patches += 1;
        let namespace = state
            .namespaces
            .get_mut(name)
            .ok_or_else(|| Error::api(404, "NotFound"))?;
        namespace
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
        Ok(())
    }

    async fn apply_mutating_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<()> {
        let mut state = self.state();
        if let Some(code) = state.fail_apply {
            return Err(Error::api(code, "Forbidden"));
        }
        state
            .configurations
            .retain(|existing| existing.name_any() != config.name_any());
        state.configurations.push(config.clone());
        Ok(())
    }

    async fn watch_pods(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
        resource_version: &str,
    ) -> Result<PodEventStream> {
        let mut state = self.state();
        state.watch_calls.push(WatchCall {
            namespace: namespace.map(str::to_string),
            label_selector: label_selector.map(str::to_string),
            resource_version: resource_version.to_string(),
        });

        match state.watches.pop_front() {
            Some(ScriptedWatch::Fail(code)) => Err(Error::api(code, "WatchFailed")),
            Some(ScriptedWatch::Events { items, keep_open }) => {
                // Scope the script like the API server would
                let namespace = namespace.map(str::to_string);
                let label_selector = label_selector.map(str::to_string);
                let items: Vec<_> = items
                    .into_iter()
                    .filter(|item| {
                        in_scope(item, namespace.as_deref(), label_selector.as_deref())
                    })
                    .collect();
                let events = stream::iter(items);
                if keep_open {
                    Ok(events.chain(stream::pending()).boxed())
                } else {
                    Ok(events.boxed())
                }
            }
            None => Ok(stream::pending().boxed()),
        }
    }

    async fn latest_pod_resource_version(
        &self,
        _namespace: Option<&str>,
        _label_selector: Option<&str>,
    ) -> Result<String> {
        Ok(self.state().latest_resource_version.clone())
    }
}

fn in_scope(
    item: &Result<WatchEvent<Pod>>,
    namespace: Option<&str>,
    label_selector: Option<&str>,
) -> bool {
    let pod = match item {
        Ok(WatchEvent::Added(pod) | WatchEvent::Modified(pod) | WatchEvent::Deleted(pod)) => pod,
        _ => return true,
    };
    if namespace.is_some_and(|namespace| pod.namespace().as_deref() != Some(namespace)) {
        return false;
    }
    label_selector.map_or(true, |selector| {
        let (key, value) = selector.split_once('=').unwrap();
        pod.labels().get(key).map(String::as_str) == Some(value)
    })
}

/// Certificate generator counting how often new material is produced
#[derive(Default)]
pub struct CountingGenerator {
    inner: RcgenGenerator,
    calls: AtomicUsize,
}

impl CountingGenerator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CertificateGenerator for CountingGenerator {
    fn generate_ca(&self, common_name: &str) -> Result<KeyMaterial> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.generate_ca(common_name)
    }

    fn generate_certificate(
        &self,
        subject_names: &[String],
        ca: &KeyMaterial,
    ) -> Result<KeyMaterial> {
        self.inner.generate_certificate(subject_names, ca)
    }
}

// Fixtures

pub fn pod(namespace: &str, name: &str, resource_version: &str, app: bool) -> Pod {
    let labels = app.then(|| BTreeMap::from([("source_type".to_string(), "APP".to_string())]));
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: Some(resource_version.to_string()),
            labels,
            ..Default::default()
        },
        spec: Some(k8s_openapi::api::core::v1::PodSpec {
            containers: vec![k8s_openapi::api::core::v1::Container {
                name: "opi".to_string(),
                image: Some("eirini/dorini".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `pod` with one more environment variable on its first container
pub fn with_env(mut pod: Pod, name: &str, value: &str) -> Pod {
    if let Some(spec) = pod.spec.as_mut() {
        spec.containers[0]
            .env
            .get_or_insert_with(Vec::new)
            .push(k8s_openapi::api::core::v1::EnvVar {
                name: name.to_string(),
                value: Some(value.to_string()),
                ..Default::default()
            });
    }
    pod
}

pub fn added(pod: Pod) -> Result<WatchEvent<Pod>> {
    Ok(WatchEvent::Added(pod))
}

pub fn modified(pod: Pod) -> Result<WatchEvent<Pod>> {
    Ok(WatchEvent::Modified(pod))
}

pub fn deleted(pod: Pod) -> Result<WatchEvent<Pod>> {
    Ok(WatchEvent::Deleted(pod))
}

pub fn bookmark(resource_version: &str) -> Result<WatchEvent<Pod>> {
    Ok(serde_json::from_value(json!({
        "type": "BOOKMARK",
        "object": {
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "resourceVersion": resource_version }
        }
    }))
    .unwrap())
}

/// In-stream error event as sent by the API server
pub fn status_error(code: u16) -> Result<WatchEvent<Pod>> {
    Ok(serde_json::from_value(json!({
        "type": "ERROR",
        "object": {
            "status": "Failure",
            "message": "too old resource version",
            "reason": "Expired",
            "code": code
        }
    }))
    .unwrap())
}

/// Transport level failure of a running stream
pub fn stream_error(code: u16) -> Result<WatchEvent<Pod>> {
    Err(Error::api(code, "StreamFailed"))
}

/// A Pod CREATE admission request
pub fn admission_request(pod: &Pod) -> AdmissionRequest<DynamicObject> {
    let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "e911857d-c318-11e8-bbad-025000000001",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "namespace": pod.namespace().unwrap_or_default(),
            "operation": "CREATE",
            "userInfo": {"username": "system:serviceaccount:eirini:opi"},
            "object": pod,
            "dryRun": false
        }
    }))
    .unwrap();
    review.try_into().unwrap()
}

/// Apply a JSON patch returned by an admission response to `pod`
pub fn apply_patch(pod: &Pod, patch: &[u8]) -> Pod {
    let patch: json_patch::Patch = serde_json::from_slice(patch).unwrap();
    let mut value = serde_json::to_value(pod).unwrap();
    json_patch::patch(&mut value, &patch).unwrap();
    serde_json::from_value(value).unwrap()
}
