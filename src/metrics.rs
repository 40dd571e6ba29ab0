//! Prometheus metrics for the extension manager
//!
//! # Exported metrics
//! The admission server's `/metrics` endpoint exports:
//! - `eirinix_admission_requests_total` (counter): admission requests labeled by extension and outcome.
//! - `eirinix_watch_events_total` (counter): Pod events dispatched to watchers, labeled by event type.
//! - `eirinix_watch_reconnects_total` (counter): times the Pod watch was re-established.
//! - `eirinix_watcher_failures_total` (counter): watcher invocations that returned an error or panicked.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Labels for admission metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AdmissionLabels {
    /// Webhook name, e.g. "0.eirini-x.org"
    pub extension: String,
    /// "allowed", "patched" or "denied"
    pub outcome: String,
}

/// Labels for watch event metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WatchEventLabels {
    pub event_type: String,
}

pub static ADMISSION_REQUESTS_TOTAL: Lazy<Family<AdmissionLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static WATCH_EVENTS_TOTAL: Lazy<Family<WatchEventLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static WATCH_RECONNECTS_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static WATCHER_FAILURES_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

/// Global metrics registry
///
/// Counters are registered without the `_total` suffix, the encoder appends it.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "eirinix_admission_requests",
        "Total number of admission requests handled per extension",
        ADMISSION_REQUESTS_TOTAL.clone(),
    );
    registry.register(
        "eirinix_watch_events",
        "Total number of Pod events dispatched to watchers",
        WATCH_EVENTS_TOTAL.clone(),
    );
    registry.register(
        "eirinix_watch_reconnects",
        "Total number of times the Pod watch was re-established",
        WATCH_RECONNECTS_TOTAL.clone(),
    );
    registry.register(
        "eirinix_watcher_failures",
        "Total number of watcher invocations that failed or panicked",
        WATCHER_FAILURES_TOTAL.clone(),
    );

    registry
});

/// Increment the admission request counter.
pub fn inc_admission_request(extension: &str, outcome: &str) {
    let labels = AdmissionLabels {
        extension: extension.to_string(),
        outcome: outcome.to_string(),
    };
    ADMISSION_REQUESTS_TOTAL.get_or_create(&labels).inc();
}

/// Increment the dispatched watch event counter.
pub fn inc_watch_event(event_type: &str) {
    let labels = WatchEventLabels {
        event_type: event_type.to_string(),
    };
    WATCH_EVENTS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_watch_reconnect() {
    WATCH_RECONNECTS_TOTAL.inc();
}

pub fn inc_watcher_failure() {
    WATCHER_FAILURES_TOTAL.inc();
}

/// Render the registry in the Prometheus text format
pub fn render() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}
