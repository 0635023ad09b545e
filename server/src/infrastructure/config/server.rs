//! Server configuration.
//!
//! Bind address, discovery timing and transport limits.

use serde::Deserialize;
use std::collections::HashMap;

/// Server settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    /// Service name registered with discovery.
    pub name: String,
    /// Address to bind, `host:port`.
    pub address: String,
    /// Address to advertise instead of the bind address.
    pub advertise: Option<String>,
    /// Service version.
    pub version: String,
    /// Registration TTL in seconds.
    pub register_ttl_secs: u64,
    /// Re-registration interval in seconds, zero disables refreshing.
    pub register_interval_secs: u64,
    /// Maximum message size in bytes.
    pub max_msg_size: usize,
    /// Maximum concurrently open connections.
    pub max_connections: Option<usize>,
    /// Seconds to wait for open calls during shutdown.
    pub grace_timeout_secs: u64,
    /// Extra node metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}
