//! Extension points
//!
//! Three kinds of handlers can be registered with a [`Manager`]:
//!
//! - [`Extension`]: mutates Pods at admission time through the webhook.
//! - [`Watcher`]: observes Pod lifecycle events from the watch loop.
//! - [`Reconciler`]: registers its own controller when the manager starts.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::DynamicObject;
use kube::ResourceExt;

use crate::error::Result;
use crate::manager::Manager;

/// A mutating admission handler for Pods
#[async_trait]
pub trait Extension: Send + Sync {
    /// Decide on an admission request for `pod`
    ///
    /// Return `AdmissionResponse::from(request)` to admit unchanged, or build
    /// a patch with [`Manager::patch_from_pod`].
    async fn handle(
        &self,
        manager: &Manager,
        pod: &Pod,
        request: &AdmissionRequest<DynamicObject>,
    ) -> AdmissionResponse;
}

/// Kind of change observed on a Pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodEventType {
    Added,
    Modified,
    Deleted,
}

impl PodEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodEventType::Added => "ADDED",
            PodEventType::Modified => "MODIFIED",
            PodEventType::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for PodEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Pod lifecycle event delivered to watchers
#[derive(Debug, Clone, PartialEq)]
pub enum PodEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
}

impl PodEvent {
    pub fn event_type(&self) -> PodEventType {
        match self {
            PodEvent::Added(_) => PodEventType::Added,
            PodEvent::Modified(_) => PodEventType::Modified,
            PodEvent::Deleted(_) => PodEventType::Deleted,
        }
    }

    pub fn pod(&self) -> &Pod {
        match self {
            PodEvent::Added(pod) | PodEvent::Modified(pod) | PodEvent::Deleted(pod) => pod,
        }
    }

    /// Resource version of the Pod carried by the event
    pub fn resource_version(&self) -> Option<String> {
        self.pod().resource_version()
    }
}

/// An observer of Pod events
///
/// Errors are logged by the watch loop and never stop delivery to the other
/// watchers.
#[async_trait]
pub trait Watcher: Send + Sync {
    async fn handle(&self, manager: &Manager, event: &PodEvent) -> Result<()>;
}

/// A handler that wires its own controller into the manager on start
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Called once by [`Manager::start`]; long-running work must be spawned
    /// and should stop when [`Manager::cancellation_token`] fires.
    async fn register(&self, manager: &Manager) -> Result<()>;
}
