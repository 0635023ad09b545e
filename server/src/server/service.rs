//! Service registrar and the frozen dispatch table.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::CallError;

use super::handler::{Handler, Method};

/// Errors raised while registering handlers or subscribers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// The service name does not start with an uppercase ASCII letter.
    #[error("rpc: type {0} is not exported")]
    NotExported(String),
    /// A service with this name already exists.
    #[error("rpc: service already defined: {0}")]
    AlreadyDefined(String),
    /// A handler declares the same method twice.
    #[error("rpc: method {method} already defined on {service}")]
    DuplicateMethod {
        /// Service name.
        service: String,
        /// Method name.
        method: String,
    },
    /// The handler has no method that can be dispatched.
    #[error("rpc: type {0} has no exported methods of suitable type")]
    NoMethods(String),
    /// A subscriber without topic.
    #[error("subscriber topic is empty")]
    EmptyTopic,
    /// A subscriber without handler functions.
    #[error("subscriber {0} has no handlers")]
    NoHandlers(String),
    /// Handlers can only be added before the server starts.
    #[error("server already started")]
    AlreadyStarted,
}

/// True when `name` starts with an uppercase ASCII letter.
#[must_use]
pub fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

/// A registered service.
#[derive(Debug)]
pub struct ServiceEntry {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl ServiceEntry {
    /// Service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up a method.
    #[must_use]
    pub fn method(&self, name: &str) -> Option<&Arc<Method>> {
        self.methods.get(name)
    }

    /// Method names in arbitrary order.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

/// Immutable `service -> method` table shared by every call.
#[derive(Debug, Default)]
pub struct ServiceTable {
    services: HashMap<String, Arc<ServiceEntry>>,
}

impl ServiceTable {
    /// Resolves a method.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::UnknownService`] or [`CallError::UnknownMethod`].
    pub fn lookup(&self, service: &str, method: &str) -> Result<Arc<Method>, CallError> {
        let entry = self
            .services
            .get(service)
            .ok_or_else(|| CallError::UnknownService(service.to_string()))?;
        entry
            .method(method)
            .cloned()
            .ok_or_else(|| CallError::UnknownMethod {
                service: service.to_string(),
                method: method.to_string(),
            })
    }

    /// Looks up a service.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&Arc<ServiceEntry>> {
        self.services.get(name)
    }

    /// Number of services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Builds the table. Lives behind the server's state lock.
#[derive(Debug, Default)]
pub struct Registrar {
    services: HashMap<String, Arc<ServiceEntry>>,
}

impl Registrar {
    /// Empty registrar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler's service.
    ///
    /// Methods with non exported names are skipped. Existing services are
    /// never overwritten.
    ///
    /// # Errors
    ///
    /// Fails for non exported or duplicate names, for methods declared twice
    /// and for handlers without a usable method.
    pub fn register(&mut self, handler: &Handler) -> Result<(), RegistrationError> {
        let name = handler.name();
        if !is_exported(name) {
            return Err(RegistrationError::NotExported(name.to_string()));
        }
        if self.services.contains_key(name) {
            return Err(RegistrationError::AlreadyDefined(name.to_string()));
        }

        let mut methods = HashMap::new();
        for method in handler.methods() {
            if !is_exported(method.name()) {
                debug!(
                    service = %name,
                    method = %method.name(),
                    "skipping method that is not exported"
                );
                continue;
            }
            if methods.contains_key(method.name()) {
                return Err(RegistrationError::DuplicateMethod {
                    service: name.to_string(),
                    method: method.name().to_string(),
                });
            }
            methods.insert(method.name().to_string(), Arc::new(method.clone()));
        }
        if methods.is_empty() {
            return Err(RegistrationError::NoMethods(name.to_string()));
        }

        self.services.insert(
            name.to_string(),
            Arc::new(ServiceEntry {
                name: name.to_string(),
                methods,
            }),
        );
        Ok(())
    }

    /// Freezes the current services into a table.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ServiceTable> {
        Arc::new(ServiceTable {
            services: self.services.clone(),
        })
    }
}
