//! Resilient Pod watch loop

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::WatchEvent;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use crate::cluster::{ClusterClient, PodEventStream};
use crate::config::ManagerOptions;
use crate::error::Result;
use crate::extension::{PodEvent, Watcher};
use crate::manager::Manager;

/// What to watch and where to start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    /// `None` watches all namespaces
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    /// Empty starts from the most recent state
    pub resource_version: String,
}

impl WatchTarget {
    pub fn from_options(options: &ManagerOptions) -> Self {
        Self {
            namespace: options.watch_namespace().map(str::to_string),
            label_selector: options.watch_label_selector(),
            resource_version: options
                .watcher_start_resource_version
                .clone()
                .unwrap_or_default(),
        }
    }
}

/// Deliver one event to every watcher in order
///
/// Errors and panics of a watcher are logged and do not stop delivery to
/// the others.
pub async fn dispatch_event(manager: &Manager, watchers: &[Arc<dyn Watcher>], event: &PodEvent) {
    #[cfg(feature = "metrics")]
    crate::metrics::inc_watch_event(event.event_type().as_str());

    for (index, watcher) in watchers.iter().enumerate() {
        match AssertUnwindSafe(watcher.handle(manager, event))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(watcher = index, event = %event.event_type(), "Watcher failed: {}", e);
                #[cfg(feature = "metrics")]
                crate::metrics::inc_watcher_failure();
            }
            Err(panic) => {
                error!(
                    watcher = index,
                    event = %event.event_type(),
                    "Watcher panicked: {}",
                    panic_message(panic.as_ref())
                );
                #[cfg(feature = "metrics")]
                crate::metrics::inc_watcher_failure();
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// A running Pod watch, reconnecting until cancelled
pub struct PodWatch<'a> {
    manager: &'a Manager,
    cluster: &'a dyn ClusterClient,
    target: WatchTarget,
    backoff: Backoff,
    cancel: CancellationToken,
}

impl<'a> PodWatch<'a> {
    pub fn new(
        manager: &'a Manager,
        cluster: &'a dyn ClusterClient,
        target: WatchTarget,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager,
            cluster,
            target,
            backoff: Backoff::default(),
            cancel,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Watch and dispatch until cancelled
    ///
    /// Only the initial connection error is returned; later disruptions are
    /// retried from the last observed resource version.
    pub async fn run(mut self) -> Result<()> {
        let Some(mut stream) = self.open().await? else {
            return Ok(());
        };
        info!(
            namespace = self.target.namespace.as_deref().unwrap_or("*"),
            selector = self.target.label_selector.as_deref().unwrap_or(""),
            resource_version = %self.target.resource_version,
            "Watching pods"
        );

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Pod watch stopped");
                    return Ok(());
                }
                next = stream.next() => next,
            };

            let reconnect = match next {
                Some(Ok(event)) => self.handle(event).await,
                Some(Err(e)) => {
                    if e.is_gone() {
                        self.resume_after_gone().await;
                    } else {
                        warn!("Pod watch failed: {}", e);
                    }
                    true
                }
                None => {
                    // Server side watch timeout, not a failure
                    debug!("Pod watch closed by the server");
                    self.backoff.reset();
                    true
                }
            };

            if reconnect {
                match self.reconnect().await {
                    Some(new_stream) => stream = new_stream,
                    None => {
                        info!("Pod watch stopped");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Open the first watch, `None` when cancelled before it is established
    async fn open(&self) -> Result<Option<PodEventStream>> {
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(None),
            stream = self.watch_pods() => stream.map(Some),
        }
    }

    async fn watch_pods(&self) -> Result<PodEventStream> {
        self.cluster
            .watch_pods(
                self.target.namespace.as_deref(),
                self.target.label_selector.as_deref(),
                &self.target.resource_version,
            )
            .await
    }

    /// Process one raw event, returning whether the stream must be re-opened
    async fn handle(&mut self, event: WatchEvent<Pod>) -> bool {
        let event = match event {
            WatchEvent::Added(pod) => PodEvent::Added(pod),
            WatchEvent::Modified(pod) => PodEvent::Modified(pod),
            WatchEvent::Deleted(pod) => PodEvent::Deleted(pod),
            WatchEvent::Bookmark(bookmark) => {
                self.target.resource_version = bookmark.metadata.resource_version;
                return false;
            }
            WatchEvent::Error(status) if status.code == 410 => {
                self.resume_after_gone().await;
                return true;
            }
            WatchEvent::Error(status) => {
                warn!(code = status.code, "Pod watch error: {}", status.message);
                return true;
            }
        };

        if let Some(resource_version) = event.resource_version() {
            self.target.resource_version = resource_version;
        }
        self.backoff.reset();
        self.manager.handle_event(&event).await;
        false
    }

    /// Skip to the current state after the last resource version expired
    async fn resume_after_gone(&mut self) {
        match self
            .cluster
            .latest_pod_resource_version(
                self.target.namespace.as_deref(),
                self.target.label_selector.as_deref(),
            )
            .await
        {
            Ok(latest) => {
                warn!(
                    expired = %self.target.resource_version,
                    resume = %latest,
                    "Resource version expired, events in between were missed"
                );
                self.target.resource_version = latest;
            }
            Err(e) => warn!("Failed to fetch current resource version: {}", e),
        }
    }

    /// Re-open the watch with backoff, `None` once cancelled
    async fn reconnect(&mut self) -> Option<PodEventStream> {
        loop {
            let delay = self.backoff.next_delay();
            debug!(
                attempt = self.backoff.attempt(),
                "Reconnecting pod watch in {:?}", delay
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            #[cfg(feature = "metrics")]
            crate::metrics::inc_watch_reconnect();

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = self.watch_pods() => result,
            };

            match result {
                Ok(stream) => {
                    info!(
                        resource_version = %self.target.resource_version,
                        "Pod watch re-established"
                    );
                    return Some(stream);
                }
                Err(e) if e.is_gone() => self.resume_after_gone().await,
                Err(e) => warn!("Failed to re-establish pod watch: {}", e),
            }
        }
    }
}
