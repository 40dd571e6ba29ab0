//! OpenTelemetry export of tracing spans
//!
//! Spans are exported over OTLP/gRPC when `OTEL_EXPORTER_OTLP_ENDPOINT` is
//! set. The W3C trace context propagator is installed so the admission
//! server can continue traces started by the API server.

use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{propagation::TraceContextPropagator, runtime, trace, Resource};
use tracing::{warn, Subscriber};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

/// Service name reported with every exported span
pub const SERVICE_NAME: &str = "eirinix";

const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Build the OpenTelemetry layer for `subscriber`
///
/// Returns `None` if the exporter pipeline cannot be installed; the process
/// then keeps logging locally without exporting spans.
pub fn init_telemetry<S>(_subscriber: &S) -> Option<OpenTelemetryLayer<S, trace::Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    global::set_text_map_propagator(TraceContextPropagator::new());

    let mut exporter = opentelemetry_otlp::new_exporter().tonic();
    if let Ok(endpoint) = std::env::var(OTLP_ENDPOINT_ENV) {
        exporter = exporter.with_endpoint(endpoint);
    }

    let resource = Resource::new(vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    match opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(trace::config().with_resource(resource))
        .install_batch(runtime::Tokio)
    {
        Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
        Err(e) => {
            warn!("Failed to install OTLP trace exporter: {}", e);
            None
        }
    }
}

/// Flush pending spans and shut the exporter down
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
