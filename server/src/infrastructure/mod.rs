/// Audit logging for lifecycle events.
pub mod audit;
/// Configuration management.
pub mod config;
/// Auxiliary HTTP mux: health, metrics and profiling.
pub mod http;
/// Telemetry setup for logging, tracing, and metrics.
pub mod telemetry;
