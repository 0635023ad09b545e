use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, propagation::TraceContextPropagator, trace::Sampler};
use opentelemetry_semantic_conventions::resource;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use super::config::TelemetrySettings;

/// Builder for setting up telemetry (Logging, Tracing, Metrics).
#[derive(Debug)]
pub struct TelemetryBuilder {
    service_name: String,
    service_version: String,
    enable_tracing: bool,
    enable_metrics: bool,
    otlp_endpoint: Option<String>,
    log_level: String,
    sampling_ratio: f64,
}

impl TelemetryBuilder {
    /// Starts a builder that logs JSON at `info` without exporters.
    #[must_use]
    pub fn new(service_name: impl Into<String>, service_version: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: service_version.into(),
            enable_tracing: false,
            enable_metrics: false,
            otlp_endpoint: None,
            log_level: "info".to_string(),
            sampling_ratio: 1.0,
        }
    }

    /// Exports spans to an OTLP collector at `endpoint`.
    #[must_use]
    pub fn with_tracing(mut self, endpoint: impl Into<String>) -> Self {
        self.enable_tracing = true;
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    /// Installs the Prometheus recorder behind `/metrics`.
    #[must_use]
    pub fn with_metrics(mut self) -> Self {
        self.enable_metrics = true;
        self
    }

    /// Filter used when `RUST_LOG` is unset.
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Fraction of root traces to sample.
    #[must_use]
    pub fn with_sampling_ratio(mut self, ratio: f64) -> Self {
        self.sampling_ratio = ratio;
        self
    }

    /// Applies log level, sampling and the optional OTLP endpoint.
    #[must_use]
    pub fn with_settings(self, settings: &TelemetrySettings) -> Self {
        let builder = self
            .with_log_level(settings.log_level.clone())
            .with_sampling_ratio(settings.sampling_ratio);
        match settings.otlp_endpoint {
            Some(ref endpoint) => builder.with_tracing(endpoint.clone()),
            None => builder,
        }
    }

    /// Initializes the telemetry system with configured exporters.
    ///
    /// # Errors
    ///
    /// Returns an error if the OTLP span exporter cannot be built or a global
    /// subscriber is already installed.
    pub fn init(self) -> Result<()> {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

        if self.enable_metrics && super::http::prometheus_handle().is_none() {
            tracing::warn!("Prometheus recorder unavailable, metrics will not be exported");
        }

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level));

        let fmt_layer = fmt::layer().json().with_span_events(FmtSpan::CLOSE).boxed();

        let registry = Registry::default().with(env_filter).with(fmt_layer);

        if self.enable_tracing {
            if let Some(endpoint) = self.otlp_endpoint {
                let resource = Resource::builder()
                    .with_attributes(vec![
                        opentelemetry::KeyValue::new(
                            resource::SERVICE_NAME,
                            self.service_name.clone(),
                        ),
                        opentelemetry::KeyValue::new(
                            resource::SERVICE_VERSION,
                            self.service_version.clone(),
                        ),
                    ])
                    .build();

                let exporter = opentelemetry_otlp::SpanExporter::builder()
                    .with_tonic()
                    .with_endpoint(endpoint)
                    .build()
                    .context("Failed to build OTLP span exporter")?;

                let processor =
                    opentelemetry_sdk::trace::BatchSpanProcessor::builder(exporter).build();

                let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
                    .with_span_processor(processor)
                    .with_resource(resource)
                    .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                        self.sampling_ratio,
                    ))))
                    .build();

                opentelemetry::global::set_tracer_provider(provider.clone());

                let tracer = provider.tracer(self.service_name.clone());

                let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

                registry
                    .with(telemetry_layer)
                    .try_init()
                    .context("Failed to init subscriber")?;
            } else {
                registry.try_init().context("Failed to init subscriber")?;
            }
        } else {
            registry.try_init().context("Failed to init subscriber")?;
        }

        Ok(())
    }
}
