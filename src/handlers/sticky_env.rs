//! Extension injecting an environment variable into every container

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EnvVar, Pod};
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tracing::debug;

use crate::extension::Extension;
use crate::manager::Manager;

/// Default variable name set by [`StickyEnvExtension`]
pub const STICKY_MESSAGE_ENV: &str = "STICKY_MESSAGE";

/// Adds `name=value` to the environment of every container that lacks it
#[derive(Debug, Clone)]
pub struct StickyEnvExtension {
    name: String,
    value: String,
}

impl StickyEnvExtension {
    /// Sets `STICKY_MESSAGE` to `value`
    pub fn new(value: impl Into<String>) -> Self {
        Self::with_name(STICKY_MESSAGE_ENV, value)
    }

    pub fn with_name(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// The Pod with the variable added to each container
    pub fn mutate(&self, pod: &Pod) -> Pod {
        let mut mutated = pod.clone();
        if let Some(spec) = mutated.spec.as_mut() {
            for container in &mut spec.containers {
                let env = container.env.get_or_insert_with(Vec::new);
                if !env.iter().any(|var| var.name == self.name) {
                    env.push(EnvVar {
                        name: self.name.clone(),
                        value: Some(self.value.clone()),
                        ..Default::default()
                    });
                }
            }
        }
        mutated
    }
}

#[async_trait]
impl Extension for StickyEnvExtension {
    async fn handle(
        &self,
        manager: &Manager,
        pod: &Pod,
        request: &AdmissionRequest<DynamicObject>,
    ) -> AdmissionResponse {
        debug!(pod = %pod.name_any(), env = %self.name, "Injecting environment variable");
        manager.patch_from_pod(request, pod, &self.mutate(pod))
    }
}
