//! Auxiliary HTTP mux for non-gRPC traffic on the server port.

use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
#[cfg(unix)]
use std::time::Duration;

#[cfg(unix)]
const PROFILE_DURATION: Duration = Duration::from_secs(10);

#[cfg(unix)]
use pprof::protos::Message;

static PROMETHEUS: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Handle of the process wide Prometheus recorder, installed on first use.
/// `None` when another recorder was installed first.
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install Prometheus recorder");
                None
            }
        })
        .clone()
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(unix)]
async fn pprof_profile() -> impl axum::response::IntoResponse {
    let guard = match pprof::ProfilerGuardBuilder::default()
        .frequency(100)
        .blocklist(&["libc", "libgcc", "pthread", "vdso"])
        .build()
    {
        Ok(g) => g,
        Err(e) => {
            tracing::error!("Failed to start profiler: {:?}", e);
            return (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                [("Content-Type", "text/plain")],
                format!("Failed to start profiler: {e:?}").into_bytes(),
            );
        }
    };

    tokio::time::sleep(PROFILE_DURATION).await;

    match guard.report().build() {
        Ok(report) => {
            let mut body = Vec::new();
            match report.pprof() {
                Ok(profile) => {
                    if let Err(e) = profile.encode(&mut body) {
                        tracing::error!("Failed to encode pprof profile: {:?}", e);
                        return (
                            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                            [("Content-Type", "text/plain")],
                            format!("Failed to encode profile: {e:?}").into_bytes(),
                        );
                    }
                    (
                        axum::http::StatusCode::OK,
                        [("Content-Type", "application/octet-stream")],
                        body,
                    )
                }
                Err(e) => {
                    tracing::error!("Failed to generate pprof: {:?}", e);
                    (
                        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                        [("Content-Type", "text/plain")],
                        format!("Failed to generate pprof: {e:?}").into_bytes(),
                    )
                }
            }
        }
        Err(e) => {
            tracing::error!("Failed to build report: {:?}", e);
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                [("Content-Type", "text/plain")],
                format!("Failed to build report: {e:?}").into_bytes(),
            )
        }
    }
}

#[cfg(not(unix))]
async fn pprof_profile() -> impl axum::response::IntoResponse {
    (
        axum::http::StatusCode::NOT_IMPLEMENTED,
        "Profiling is only available on Unix systems",
    )
}

/// Health, metrics and profiling routes served next to the RPC transport.
#[must_use]
pub fn aux_router() -> Router {
    let metrics = prometheus_handle();
    Router::new()
        .route("/health/live", get(health_check))
        .route("/health/ready", get(health_check))
        .route(
            "/metrics",
            get(move || {
                let body = metrics.as_ref().map(PrometheusHandle::render).unwrap_or_default();
                std::future::ready(body)
            }),
        )
        .route("/debug/pprof/profile", get(pprof_profile))
        .fallback(not_found)
}

async fn not_found() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}
