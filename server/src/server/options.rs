//! Server construction options.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::Broker;
use crate::infrastructure::config::server::ServerSettings;
use crate::registry::Registry;
use crate::util::drain::Drain;

use super::codecs::{CodecEntry, Codecs};
use super::handler::{HandlerWrapper, StreamWrapper};
use super::router::Router;
use super::subscriber::SubscriberWrapper;

/// Default registration TTL.
pub const DEFAULT_REGISTER_TTL: Duration = Duration::from_secs(90);
/// Default re-registration interval.
pub const DEFAULT_REGISTER_INTERVAL: Duration = Duration::from_secs(30);
/// Default maximum message size.
pub const DEFAULT_MAX_MSG_SIZE: usize = 32 * 1024 * 1024;
/// Default grace period for open calls on stop.
pub const DEFAULT_GRACE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a [`Server`](super::Server) is built from.
///
/// Collaborators are optional: without a registry the server never
/// advertises itself, without a broker subscribing fails.
#[derive(Clone)]
pub struct ServerOptions {
    /// Service name.
    pub name: String,
    /// Node id suffix, a fresh uuid by default.
    pub id: String,
    /// Service version.
    pub version: String,
    /// Bind address.
    pub address: String,
    /// Address advertised instead of the bound one.
    pub advertise: Option<String>,
    /// Extra node metadata.
    pub metadata: HashMap<String, String>,
    /// Registration TTL.
    pub register_ttl: Duration,
    /// Refresh interval, `Duration::ZERO` disables the ticker.
    pub register_interval: Duration,
    /// Largest accepted frame.
    pub max_msg_size: usize,
    /// Cap on open connections.
    pub max_connections: Option<usize>,
    /// Time open calls get on stop before being cancelled.
    pub grace_timeout: Duration,
    /// Discovery backend.
    pub registry: Option<Arc<dyn Registry>>,
    /// Message broker.
    pub broker: Option<Arc<dyn Broker>>,
    /// Generic router replacing method table lookup.
    pub router: Option<Arc<dyn Router>>,
    /// Content-type table.
    pub codecs: Codecs,
    /// Unary call wrappers, first registered outermost.
    pub handler_wrappers: Vec<HandlerWrapper>,
    /// Streaming call wrappers.
    pub stream_wrappers: Vec<StreamWrapper>,
    /// Subscriber wrappers.
    pub subscriber_wrappers: Vec<SubscriberWrapper>,
    /// In-flight counter waited on during shutdown.
    pub drain: Option<Drain>,
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("version", &self.version)
            .field("address", &self.address)
            .field("advertise", &self.advertise)
            .field("register_ttl", &self.register_ttl)
            .field("register_interval", &self.register_interval)
            .field("max_msg_size", &self.max_msg_size)
            .field("max_connections", &self.max_connections)
            .field("grace_timeout", &self.grace_timeout)
            .field("registry", &self.registry.as_ref().map(|r| r.name().to_string()))
            .field("broker", &self.broker.as_ref().map(|b| b.name().to_string()))
            .finish_non_exhaustive()
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::new("go.vine.server")
    }
}

impl ServerOptions {
    /// Options for a service called `name` bound to an ephemeral port.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: uuid::Uuid::new_v4().to_string(),
            version: "latest".to_string(),
            address: "0.0.0.0:0".to_string(),
            advertise: None,
            metadata: HashMap::new(),
            register_ttl: DEFAULT_REGISTER_TTL,
            register_interval: DEFAULT_REGISTER_INTERVAL,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            max_connections: None,
            grace_timeout: DEFAULT_GRACE_TIMEOUT,
            registry: None,
            broker: None,
            router: None,
            codecs: Codecs::default(),
            handler_wrappers: Vec::new(),
            stream_wrappers: Vec::new(),
            subscriber_wrappers: Vec::new(),
            drain: None,
        }
    }

    /// Options from loaded settings.
    #[must_use]
    pub fn from_settings(settings: &ServerSettings) -> Self {
        let mut opts = Self::new(settings.name.clone())
            .with_version(settings.version.clone())
            .with_address(settings.address.clone())
            .with_register_ttl(Duration::from_secs(settings.register_ttl_secs))
            .with_register_interval(Duration::from_secs(settings.register_interval_secs))
            .with_max_msg_size(settings.max_msg_size)
            .with_grace_timeout(Duration::from_secs(settings.grace_timeout_secs));
        opts.advertise.clone_from(&settings.advertise);
        opts.max_connections = settings.max_connections;
        opts.metadata.clone_from(&settings.metadata);
        opts
    }

    /// Node id suffix.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Service version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Bind address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Advertised address.
    #[must_use]
    pub fn with_advertise(mut self, advertise: impl Into<String>) -> Self {
        self.advertise = Some(advertise.into());
        self
    }

    /// Adds one node metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Registration TTL.
    #[must_use]
    pub fn with_register_ttl(mut self, ttl: Duration) -> Self {
        self.register_ttl = ttl;
        self
    }

    /// Refresh interval.
    #[must_use]
    pub fn with_register_interval(mut self, interval: Duration) -> Self {
        self.register_interval = interval;
        self
    }

    /// Largest accepted frame.
    #[must_use]
    pub fn with_max_msg_size(mut self, size: usize) -> Self {
        self.max_msg_size = size;
        self
    }

    /// Cap on open connections.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Grace period on stop.
    #[must_use]
    pub fn with_grace_timeout(mut self, timeout: Duration) -> Self {
        self.grace_timeout = timeout;
        self
    }

    /// Discovery backend.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Message broker.
    #[must_use]
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Generic router.
    #[must_use]
    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    /// Registers or replaces a codec for `content_type`.
    #[must_use]
    pub fn with_codec(mut self, content_type: &str, entry: CodecEntry) -> Self {
        self.codecs.insert(content_type, entry);
        self
    }

    /// Appends a unary call wrapper.
    #[must_use]
    pub fn with_handler_wrapper(mut self, wrapper: HandlerWrapper) -> Self {
        self.handler_wrappers.push(wrapper);
        self
    }

    /// Appends a streaming call wrapper.
    #[must_use]
    pub fn with_stream_wrapper(mut self, wrapper: StreamWrapper) -> Self {
        self.stream_wrappers.push(wrapper);
        self
    }

    /// Appends a subscriber wrapper.
    #[must_use]
    pub fn with_subscriber_wrapper(mut self, wrapper: SubscriberWrapper) -> Self {
        self.subscriber_wrappers.push(wrapper);
        self
    }

    /// In-flight counter waited on during shutdown.
    #[must_use]
    pub fn with_drain(mut self, drain: Drain) -> Self {
        self.drain = Some(drain);
        self
    }

    /// `name-id`, the registered node id.
    #[must_use]
    pub fn node_id(&self) -> String {
        format!("{}-{}", self.name, self.id)
    }
}
