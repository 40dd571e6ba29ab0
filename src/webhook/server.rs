//! Admission Webhook Server
//!
//! Serves one `POST /{index}` route per registered extension over TLS, plus
//! `GET /healthz` and `GET /metrics`.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::{
    extract::{Path as UrlPath, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use opentelemetry::{global, propagation::Extractor};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::adapter::MutatingWebhook;
use crate::certificate::{TLS_CERT_FILE, TLS_KEY_FILE};
use crate::error::{Error, Result};
use crate::manager::Manager;

/// Time given to in-flight admission requests on shutdown
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

struct HeaderExtractor<'a>(&'a HeaderMap);

impl<'a> Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v: &HeaderValue| v.to_str().ok())
    }
    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k: &HeaderName| k.as_str()).collect()
    }
}

async fn extract_trace_context(request: Request, next: Next) -> Response {
    let parent_cx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(request.headers()))
    });
    tracing::Span::current().set_parent(parent_cx);
    next.run(request).await
}

/// Shared state of the admission routes
struct AdmissionState {
    manager: Manager,
    webhooks: Vec<MutatingWebhook>,
}

/// Build the admission router for the given webhooks
pub fn router(manager: Manager, webhooks: Vec<MutatingWebhook>) -> Router {
    let state = Arc::new(AdmissionState { manager, webhooks });

    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/{index}", post(admission_handler))
        .layer(middleware::from_fn(extract_trace_context))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Load the serving certificate written by the certificate bootstrap
pub async fn load_tls_config(cert_dir: &Path) -> Result<RustlsConfig> {
    let cert_pem = tokio::fs::read(cert_dir.join(TLS_CERT_FILE)).await?;
    let key_pem = tokio::fs::read(cert_dir.join(TLS_KEY_FILE)).await?;

    let certs = CertificateDer::pem_slice_iter(&cert_pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::CertificateError(format!("Failed to parse certificates: {e}")))?;
    let key = PrivateKeyDer::from_pem_slice(&key_pem)
        .map_err(|e| Error::CertificateError(format!("Failed to parse private key: {e}")))?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let server_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::ServerError(format!("Unsupported TLS versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::ServerError(format!("Failed to create server config: {e}")))?;

    Ok(RustlsConfig::from_config(Arc::new(server_config)))
}

/// Serve admission traffic until `shutdown` is cancelled
pub async fn serve(
    manager: Manager,
    webhooks: Vec<MutatingWebhook>,
    addr: SocketAddr,
    cert_dir: &Path,
    shutdown: CancellationToken,
) -> Result<()> {
    let tls = load_tls_config(cert_dir).await?;
    let paths: Vec<String> = webhooks.iter().map(MutatingWebhook::path).collect();
    let app = router(manager, webhooks);

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        shutdown_handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_TIMEOUT));
    });

    info!(
        "Admission server listening on {} with paths [{}]",
        addr,
        paths.join(", ")
    );

    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| Error::ServerError(format!("Server error: {e}")))?;

    info!("Admission server stopped");
    Ok(())
}

// HTTP Handlers

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(feature = "metrics")]
async fn metrics_handler() -> Response {
    match crate::metrics::render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(not(feature = "metrics"))]
async fn metrics_handler() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

#[instrument(skip(state, review))]
async fn admission_handler(
    State(state): State<Arc<AdmissionState>>,
    UrlPath(index): UrlPath<usize>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> impl IntoResponse {
    let Some(webhook) = state.webhooks.get(index) else {
        error!("No extension registered at index {}", index);
        return (
            StatusCode::NOT_FOUND,
            Json(AdmissionResponse::invalid(format!("no extension at /{index}")).into_review()),
        );
    };

    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!("Failed to parse admission request: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(
                    AdmissionResponse::invalid(format!("Invalid admission request: {e}"))
                        .into_review(),
                ),
            );
        }
    };

    let response = webhook.handle(&state.manager, &request).await;

    #[cfg(feature = "metrics")]
    crate::metrics::inc_admission_request(webhook.name(), outcome(&response));

    (StatusCode::OK, Json(response.into_review()))
}

#[cfg_attr(not(feature = "metrics"), allow(dead_code))]
fn outcome(response: &AdmissionResponse) -> &'static str {
    if !response.allowed {
        "denied"
    } else if response
        .patch
        .as_deref()
        .is_some_and(|patch| patch != b"[]")
    {
        "patched"
    } else {
        "allowed"
    }
}
