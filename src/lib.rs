//! EiriniX: extension framework for application Pods on Kubernetes
//!
//! Extensions mutate Pods at admission time through a mutating webhook,
//! watchers observe Pod lifecycle events, and reconcilers drive their own
//! controllers. The [`Manager`] bootstraps the webhook certificate,
//! registers the webhook configuration and runs everything until stopped.

pub mod certificate;
pub mod cluster;
pub mod config;
pub mod error;
pub mod extension;
pub mod handlers;
pub mod manager;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod telemetry;
pub mod watch;
pub mod webhook;

pub use crate::cluster::{ClusterClient, KubeCluster};
pub use crate::config::{FailurePolicy, ManagerOptions};
pub use crate::error::{Error, Result};
pub use crate::extension::{Extension, PodEvent, PodEventType, Reconciler, Watcher};
pub use crate::manager::{Manager, ManagerState};
