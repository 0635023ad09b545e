//! Telemetry configuration.

use serde::Deserialize;

/// Telemetry configuration settings.
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetrySettings {
    /// OTLP endpoint for traces.
    pub otlp_endpoint: Option<String>,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Sampling ratio for traces.
    #[serde(default = "default_sampling")]
    pub sampling_ratio: f64,
}

pub(super) fn default_sampling() -> f64 {
    1.0
}
