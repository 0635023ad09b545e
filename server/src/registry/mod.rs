//! Service discovery collaborator.
//!
//! The server only ever registers and deregisters itself; storage, watch and
//! lookup semantics belong to the [`Registry`] implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Errors reported by a registry implementation.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The registry could not be reached.
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    /// The service or node is unknown to the registry.
    #[error("service not found: {0}")]
    NotFound(String),
    /// Any other registry failure.
    #[error("registry: {0}")]
    Other(String),
}

impl RegistryError {
    /// True for failures worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Shape of a request or response body advertised with an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Value {
    /// Field or message name.
    pub name: String,
    /// Type name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Nested fields, when known.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
}

impl Value {
    /// A value named after its type.
    #[must_use]
    pub fn of_type(kind: &str) -> Self {
        Self {
            name: kind.to_string(),
            kind: kind.to_string(),
            values: Vec::new(),
        }
    }
}

/// One callable method or topic handler.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Endpoint {
    /// `Service.Method` or the handler name for subscribers.
    pub name: String,
    /// Request shape.
    pub request: Option<Value>,
    /// Response shape.
    pub response: Option<Value>,
    /// Tags such as `stream` or `subscriber`.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// One running instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Node {
    /// `name-uuid`.
    pub id: String,
    /// Advertised `host:port`.
    pub address: String,
    /// Transport, protocol and collaborator names.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Registration unit handed to the registry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Service {
    /// Service name.
    pub name: String,
    /// Service version.
    pub version: String,
    /// Service level metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Advertised endpoints.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Instances.
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Attached API documents, opaque to the server.
    #[serde(default)]
    pub apis: Vec<serde_json::Value>,
}

/// Options for a single registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterOptions {
    /// Time after which a non-refreshed registration expires.
    pub ttl: Option<Duration>,
}

/// Service discovery backend.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Registers or refreshes the service's nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry rejects or cannot store the entry.
    async fn register(&self, service: &Service, opts: RegisterOptions) -> Result<(), RegistryError>;

    /// Removes the service's nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be updated.
    async fn deregister(&self, service: &Service) -> Result<(), RegistryError>;

    /// Looks up every version of a service.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] when nothing is registered.
    async fn get_service(&self, name: &str) -> Result<Vec<Service>, RegistryError>;

    /// Implementation name, advertised in node metadata.
    fn name(&self) -> &str;
}
