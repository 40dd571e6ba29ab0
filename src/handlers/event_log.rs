//! Watcher logging every Pod event

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::info;

use crate::error::Result;
use crate::extension::{PodEvent, Watcher};
use crate::manager::Manager;

/// Logs each Pod event with its phase
#[derive(Debug, Clone, Default)]
pub struct EventLogWatcher;

#[async_trait]
impl Watcher for EventLogWatcher {
    async fn handle(&self, _manager: &Manager, event: &PodEvent) -> Result<()> {
        let pod = event.pod();
        let phase = pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .unwrap_or("Unknown");

        info!(
            event = %event.event_type(),
            namespace = %pod.namespace().unwrap_or_default(),
            pod = %pod.name_any(),
            phase,
            resource_version = %event.resource_version().unwrap_or_default(),
            "Pod event"
        );
        Ok(())
    }
}
