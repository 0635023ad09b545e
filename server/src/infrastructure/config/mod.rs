//! Configuration management for vine servers.
//!
//! Settings are layered from built-in defaults and `VINE__`-prefixed
//! environment variables, e.g. `VINE__SERVER__ADDRESS=0.0.0.0:8080`.
//!
//! # Example
//!
//! ```
//! use vine_server::infrastructure::config::Settings;
//!
//! let settings = Settings::new().expect("Failed to load configuration");
//! assert!(!settings.server.name.is_empty());
//! ```

pub mod server;
pub mod telemetry;

pub use server::ServerSettings;
pub use telemetry::TelemetrySettings;

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Server settings.
    pub server: ServerSettings,
    /// Telemetry settings.
    pub telemetry: TelemetrySettings,
}

impl Settings {
    /// Creates a new settings instance from environment variables and defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be built or deserialized.
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_source(Environment::with_prefix("VINE").separator("__"))
    }

    /// Builds settings from defaults overlaid with `source`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be built or deserialized.
    pub fn from_source<S>(source: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let s = Config::builder()
            .set_default("server.name", "go.vine.server")?
            .set_default("server.address", "0.0.0.0:0")?
            .set_default("server.version", "latest")?
            .set_default("server.register_ttl_secs", 90)?
            .set_default("server.register_interval_secs", 30)?
            .set_default("server.max_msg_size", 32 * 1024 * 1024)?
            .set_default("server.grace_timeout_secs", 10)?
            .set_default("telemetry.log_level", "info")?
            .set_default("telemetry.sampling_ratio", 1.0)?
            .add_source(source)
            .build()?;

        s.try_deserialize()
    }
}
