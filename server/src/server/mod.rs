//! The RPC server: method registration, transport, discovery and shutdown.
//!
//! A [`Server`] collects handlers and subscribers while unstarted. [`Server::start`]
//! freezes the method table, binds the transport, registers the node with the
//! configured registry and subscribes to the broker. A background task keeps
//! the registration alive and runs the shutdown sequence once
//! [`Server::stop`] is called.

/// Codec table keyed by content-type.
pub mod codecs;
/// Built-in debug service.
pub mod debug;
/// Call dispatch onto the method table.
pub mod dispatch;
/// Handler definitions and typed method registration.
pub mod handler;
/// Server options.
pub mod options;
/// Generic routing seam.
pub mod router;
/// Method table and its registrar.
pub mod service;
/// Frame level call streams.
pub mod stream;
/// Broker message dispatch.
pub mod subscriber;
/// HTTP/2 transport.
pub mod transport;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, Subscription};
use crate::infrastructure::audit::{AuditEvent, log_audit};
use crate::infrastructure::http;
use crate::registry::{Endpoint, Node, RegisterOptions, Registry, RegistryError, Service};
use crate::util::{addr, backoff};

pub use handler::Handler;
pub use options::ServerOptions;
pub use service::RegistrationError;
pub use subscriber::Subscriber;

use dispatch::Dispatcher;
use service::Registrar;
use subscriber::{SubHandlerOptions, create_sub_handler};
use transport::LimitListener;

/// Errors from the server lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// A handler or subscriber was rejected.
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    /// The registry failed after all retries.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The broker failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// The listener could not be opened.
    #[error("listener: {0}")]
    Io(#[from] std::io::Error),
    /// `start` was called twice.
    #[error("server already started")]
    AlreadyStarted,
    /// A subscriber was added without a broker.
    #[error("no broker configured for topic {0}")]
    NoBroker(String),
}

/// Where the server is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Accepting registrations.
    Unstarted,
    /// Serving.
    Started,
    /// Running the shutdown sequence.
    Stopping,
    /// Done.
    Stopped,
}

type ExitReply = oneshot::Sender<Result<(), ServerError>>;

struct State {
    opts: ServerOptions,
    registrar: Registrar,
    endpoints: Vec<Endpoint>,
    subscribers: Vec<Arc<Subscriber>>,
    subscriptions: Vec<Box<dyn Subscription>>,
    run: RunState,
    registered: bool,
    cached: Option<Service>,
    exit: Option<oneshot::Sender<ExitReply>>,
    local_addr: Option<SocketAddr>,
    calls: CancellationToken,
}

struct Inner {
    state: RwLock<State>,
    listener: Mutex<Option<TcpListener>>,
    /// Serializes register and deregister cycles.
    cycle: tokio::sync::Mutex<()>,
}

/// An RPC server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Server")
            .field("name", &state.opts.name)
            .field("run", &state.run)
            .field("registered", &state.registered)
            .field("local_addr", &state.local_addr)
            .finish_non_exhaustive()
    }
}

/// Starts a handler definition for service `name`.
#[must_use]
pub fn new_handler(name: impl Into<String>) -> Handler {
    Handler::new(name)
}

/// Starts a subscriber for `topic`.
#[must_use]
pub fn new_subscriber(topic: impl Into<String>) -> Subscriber {
    Subscriber::new(topic)
}

impl Server {
    /// A server with the built-in `Debug` service registered.
    #[must_use]
    pub fn new(opts: ServerOptions) -> Self {
        let mut registrar = Registrar::new();
        if let Err(e) = registrar.register(&debug::handler()) {
            warn!(error = %e, "Failed to register debug handler");
        }
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State {
                    opts,
                    registrar,
                    endpoints: Vec::new(),
                    subscribers: Vec::new(),
                    subscriptions: Vec::new(),
                    run: RunState::Unstarted,
                    registered: false,
                    cached: None,
                    exit: None,
                    local_addr: None,
                    calls: CancellationToken::new(),
                }),
                listener: Mutex::new(None),
                cycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Serves on `listener` instead of binding the configured address.
    #[must_use]
    pub fn with_listener(self, listener: TcpListener) -> Self {
        *self.inner.listener.lock() = Some(listener);
        self
    }

    /// Current options.
    #[must_use]
    pub fn options(&self) -> ServerOptions {
        self.inner.state.read().opts.clone()
    }

    /// Adjusts the options before start.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyStarted`] once started.
    pub fn init(&self, f: impl FnOnce(&mut ServerOptions)) -> Result<(), ServerError> {
        let mut state = self.inner.state.write();
        if state.run != RunState::Unstarted {
            return Err(ServerError::AlreadyStarted);
        }
        f(&mut state.opts);
        state.cached = None;
        Ok(())
    }

    /// Adds a handler's methods to the method table.
    ///
    /// # Errors
    ///
    /// Returns the registrar's rejection, or `AlreadyStarted` once serving.
    pub fn handle(&self, handler: &Handler) -> Result<(), ServerError> {
        let mut state = self.inner.state.write();
        if state.run != RunState::Unstarted {
            return Err(RegistrationError::AlreadyStarted.into());
        }
        state.registrar.register(handler)?;
        if !handler.options().internal {
            state.endpoints.extend(handler.endpoints());
        }
        debug!(service = handler.name(), "Handler registered");
        Ok(())
    }

    /// Adds a subscriber, subscribed to the broker on first registration.
    ///
    /// # Errors
    ///
    /// Fails for an empty topic, a subscriber without handlers, a missing
    /// broker, or once serving.
    pub fn subscribe(&self, subscriber: Subscriber) -> Result<(), ServerError> {
        if subscriber.topic().is_empty() {
            return Err(RegistrationError::EmptyTopic.into());
        }
        if subscriber.handler_count() == 0 {
            return Err(RegistrationError::NoHandlers(subscriber.topic().to_string()).into());
        }
        let mut state = self.inner.state.write();
        if state.run != RunState::Unstarted {
            return Err(RegistrationError::AlreadyStarted.into());
        }
        if state.opts.broker.is_none() {
            return Err(ServerError::NoBroker(subscriber.topic().to_string()));
        }
        debug!(topic = subscriber.topic(), "Subscriber added");
        state.subscribers.push(Arc::new(subscriber));
        Ok(())
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.inner.state.read().run
    }

    /// True between a successful registration and the next deregistration.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.inner.state.read().registered
    }

    /// Bound address once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.read().local_addr
    }

    fn service(&self) -> (Service, bool) {
        let state = self.inner.state.read();
        if let Some(service) = &state.cached {
            return (service.clone(), true);
        }
        let opts = &state.opts;
        let address = opts
            .advertise
            .clone()
            .or_else(|| state.local_addr.map(|a| a.to_string()))
            .unwrap_or_else(|| opts.address.clone());
        let (host, port) = addr::split_host_port(&address);
        let host = addr::extract(&host);
        let cacheable = addr::is_ip_literal(&host);

        let mut metadata = opts.metadata.clone();
        metadata.insert("transport".into(), "http2".into());
        metadata.insert("protocol".into(), "grpc".into());
        metadata.insert("server".into(), "vine".into());
        if let Some(registry) = &opts.registry {
            metadata.insert("registry".into(), registry.name().to_string());
        }
        if let Some(broker) = &opts.broker {
            metadata.insert("broker".into(), broker.name().to_string());
        }

        let mut endpoints = state.endpoints.clone();
        for subscriber in state.subscribers.iter().filter(|s| !s.options().internal) {
            endpoints.extend(subscriber.endpoints());
        }
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));

        let service = Service {
            name: opts.name.clone(),
            version: opts.version.clone(),
            metadata: HashMap::new(),
            endpoints,
            nodes: vec![Node {
                id: opts.node_id(),
                address: addr::join_host_port(&host, &port),
                metadata,
            }],
            apis: Vec::new(),
        };
        (service, cacheable)
    }

    /// Registers the node and, once per cycle, subscribes to the broker.
    ///
    /// # Errors
    ///
    /// Returns the registry error after all retries, or the broker error of
    /// a failed subscription. On a broker error every subscription created
    /// in this attempt is removed again.
    pub async fn register(&self) -> Result<(), ServerError> {
        let _cycle = self.inner.cycle.lock().await;
        let (service, cacheable) = self.service();
        let (registry, ttl) = {
            let state = self.inner.state.read();
            (state.opts.registry.clone(), state.opts.register_ttl)
        };

        if let Some(registry) = &registry {
            let registry: &dyn Registry = registry.as_ref();
            let service = &service;
            let opts = RegisterOptions { ttl: Some(ttl) };
            let registered =
                backoff::retry(backoff::REGISTER_RETRIES, move |_| registry.register(service, opts))
                    .await;
            if let Err(e) = registered {
                metrics::counter!(
                    "vine_registry_register_failures_total",
                    "service" => service.name.clone()
                )
                .increment(1);
                return Err(e.into());
            }
        }

        let pending = {
            let mut state = self.inner.state.write();
            if cacheable && state.cached.is_none() {
                state.cached = Some(service.clone());
            }
            if state.registered {
                return Ok(());
            }
            state.registered = true;
            let handler_opts = SubHandlerOptions {
                codecs: state.opts.codecs.clone(),
                wrappers: state.opts.subscriber_wrappers.clone(),
                drain: state.opts.drain.clone(),
                shutdown: state.calls.clone(),
            };
            (state.opts.broker.clone(), state.subscribers.clone(), handler_opts)
        };

        let (broker, subscribers, handler_opts) = pending;
        let mut created = Vec::new();
        if let Some(broker) = broker {
            for subscriber in subscribers {
                let handler = create_sub_handler(Arc::clone(&subscriber), handler_opts.clone());
                match broker
                    .subscribe(subscriber.topic(), handler, subscriber.subscribe_options())
                    .await
                {
                    Ok(subscription) => created.push(subscription),
                    Err(e) => {
                        error!(topic = subscriber.topic(), error = %e, "Subscribe failed");
                        unsubscribe_all(created).await;
                        self.inner.state.write().registered = false;
                        return Err(e.into());
                    }
                }
            }
        }

        let node = service.nodes.first().map(|n| n.id.clone()).unwrap_or_default();
        self.inner.state.write().subscriptions.extend(created);
        info!(service = %service.name, node = %node, "Service registered");
        log_audit(&AuditEvent::ServiceRegistered {
            service: service.name.clone(),
            node,
            registry: registry.as_ref().map(|r| r.name().to_string()).unwrap_or_default(),
        });
        Ok(())
    }

    /// Removes the node from the registry and drops every broker
    /// subscription. A no-op for subscriptions when not registered.
    ///
    /// # Errors
    ///
    /// Returns the registry error after all retries.
    pub async fn deregister(&self) -> Result<(), ServerError> {
        let _cycle = self.inner.cycle.lock().await;
        let (service, _) = self.service();
        let registry = self.inner.state.read().opts.registry.clone();
        if let Some(registry) = &registry {
            let registry: &dyn Registry = registry.as_ref();
            let service = &service;
            backoff::retry(backoff::REGISTER_RETRIES, move |_| registry.deregister(service)).await?;
        }

        let subscriptions = {
            let mut state = self.inner.state.write();
            state.cached = None;
            if !state.registered {
                return Ok(());
            }
            state.registered = false;
            std::mem::take(&mut state.subscriptions)
        };
        unsubscribe_all(subscriptions).await;

        let node = service.nodes.first().map(|n| n.id.clone()).unwrap_or_default();
        info!(service = %service.name, node = %node, "Service deregistered");
        log_audit(&AuditEvent::ServiceDeregistered {
            service: service.name.clone(),
            node,
        });
        Ok(())
    }

    /// Binds the transport, registers the node and starts serving in the
    /// background.
    ///
    /// # Errors
    ///
    /// Fails when already started, when the listener cannot be opened, or
    /// when the broker connect or the initial registration fails. The
    /// server is unstarted again after a failure.
    pub async fn start(&self) -> Result<(), ServerError> {
        {
            let mut state = self.inner.state.write();
            if state.run != RunState::Unstarted {
                return Err(ServerError::AlreadyStarted);
            }
            state.run = RunState::Started;
        }
        match self.try_start().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut state = self.inner.state.write();
                state.run = RunState::Unstarted;
                state.local_addr = None;
                state.cached = None;
                Err(e)
            }
        }
    }

    async fn try_start(&self) -> Result<(), ServerError> {
        let injected = self.inner.listener.lock().take();
        let listener = match injected {
            Some(listener) => listener,
            None => {
                let address = self.inner.state.read().opts.address.clone();
                TcpListener::bind(address.as_str()).await?
            }
        };
        let local_addr = listener.local_addr()?;

        let (opts, dispatcher, has_subscribers) = {
            let mut state = self.inner.state.write();
            state.local_addr = Some(local_addr);
            let opts = state.opts.clone();
            let dispatcher = Dispatcher::new(state.registrar.snapshot())
                .with_codecs(opts.codecs.clone())
                .with_router(opts.router.clone())
                .with_wrappers(opts.handler_wrappers.clone(), opts.stream_wrappers.clone())
                .with_drain(opts.drain.clone())
                .with_shutdown(state.calls.clone());
            (opts, dispatcher, !state.subscribers.is_empty())
        };

        if has_subscribers {
            if let Some(broker) = &opts.broker {
                broker.connect().await?;
                info!(broker = broker.name(), address = %broker.address(), "Broker connected");
            }
        }

        if let Err(e) = self.register().await {
            if has_subscribers {
                disconnect_broker(&opts).await;
            }
            return Err(e);
        }

        let app = transport::app(Arc::new(dispatcher), opts.max_msg_size, http::aux_router());
        let graceful = CancellationToken::new();
        let serving = spawn_serve(listener, opts.max_connections, app, graceful.clone());

        let (exit_tx, exit_rx) = oneshot::channel();
        self.inner.state.write().exit = Some(exit_tx);

        let server = self.clone();
        tokio::spawn(async move { server.run(exit_rx, graceful, serving).await });

        info!(service = %opts.name, address = %local_addr, "Server started");
        log_audit(&AuditEvent::ServerStarted {
            service: opts.name.clone(),
            address: local_addr.to_string(),
        });
        Ok(())
    }

    async fn run(
        self,
        mut exit: oneshot::Receiver<ExitReply>,
        graceful: CancellationToken,
        mut serving: JoinHandle<std::io::Result<()>>,
    ) {
        let opts = self.options();
        let mut ticker = ticker(opts.register_interval);

        let reply = loop {
            tokio::select! {
                reply = &mut exit => break reply.ok(),
                () = next_tick(&mut ticker) => {
                    if let Err(e) = self.register().await {
                        warn!(service = %opts.name, error = %e, "Registration refresh failed");
                    }
                }
            }
        };

        self.inner.state.write().run = RunState::Stopping;
        let mut result = Ok(());

        if let Err(e) = self.deregister().await {
            error!(service = %opts.name, error = %e, "Deregister failed");
            result = Err(e);
        }

        if let Some(drain) = &opts.drain {
            if tokio::time::timeout(opts.grace_timeout, drain.wait()).await.is_err() {
                warn!(active = drain.active(), "Drain wait timed out");
            }
        }

        graceful.cancel();
        match tokio::time::timeout(opts.grace_timeout, &mut serving).await {
            Ok(Ok(Ok(()))) => debug!("Transport stopped"),
            Ok(Ok(Err(e))) => error!(error = %e, "Transport failed"),
            Ok(Err(e)) => error!(error = %e, "Transport task failed"),
            Err(_) => {
                warn!(grace = ?opts.grace_timeout, "Graceful stop timed out, forcing shutdown");
                serving.abort();
            }
        }
        let calls = self.inner.state.read().calls.clone();
        calls.cancel();

        let has_subscribers = !self.inner.state.read().subscribers.is_empty();
        if has_subscribers {
            if let Some(broker) = &opts.broker {
                if let Err(e) = broker.disconnect().await {
                    error!(error = %e, "Broker disconnect failed");
                    if result.is_ok() {
                        result = Err(e.into());
                    }
                }
            }
        }

        {
            let mut state = self.inner.state.write();
            state.run = RunState::Stopped;
            state.local_addr = None;
        }
        info!(service = %opts.name, "Server stopped");
        log_audit(&AuditEvent::ServerStopped { service: opts.name });

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    /// Runs the shutdown sequence and waits for it. Returns immediately
    /// when the server is not serving.
    ///
    /// # Errors
    ///
    /// Returns the first failure of the shutdown sequence.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let Some(exit) = self.inner.state.write().exit.take() else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        if exit.send(tx).is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }
}

async fn unsubscribe_all(subscriptions: Vec<Box<dyn Subscription>>) {
    let results = join_all(subscriptions.iter().map(|s| s.unsubscribe())).await;
    for (subscription, result) in subscriptions.iter().zip(results) {
        if let Err(e) = result {
            warn!(topic = subscription.topic(), error = %e, "Unsubscribe failed");
        }
    }
}

async fn disconnect_broker(opts: &ServerOptions) {
    if let Some(broker) = &opts.broker {
        if let Err(e) = broker.disconnect().await {
            warn!(error = %e, "Broker disconnect failed");
        }
    }
}

fn spawn_serve(
    listener: TcpListener,
    max_connections: Option<usize>,
    app: axum::Router,
    shutdown: CancellationToken,
) -> JoinHandle<std::io::Result<()>> {
    match max_connections {
        Some(max) => {
            let listener = LimitListener::new(listener, max);
            tokio::spawn(transport::serve(listener, app, shutdown))
        }
        None => tokio::spawn(transport::serve(listener, app, shutdown)),
    }
}

fn ticker(interval: Duration) -> Option<Interval> {
    if interval.is_zero() {
        return None;
    }
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::error::CallError;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
    struct Ping {
        #[prost(string, tag = "1")]
        msg: String,
    }

    fn echo() -> Handler {
        new_handler("Echo")
            .unary("Call", |_ctx: Context, req: Ping| async move { Ok::<_, CallError>(req) })
    }

    fn server() -> Server {
        Server::new(ServerOptions::new("greeter").with_id("1").with_advertise("10.1.2.3:7000"))
    }

    #[test]
    fn duplicate_handler_is_rejected() {
        let server = server();
        server.handle(&echo()).unwrap();
        let err = server.handle(&echo()).unwrap_err();
        assert!(matches!(
            err,
            ServerError::Registration(RegistrationError::AlreadyDefined(ref name)) if name == "Echo"
        ));
    }

    #[test]
    fn debug_service_is_never_advertised() {
        let server = server();
        server.handle(&echo()).unwrap();
        let (service, cacheable) = server.service();
        assert!(cacheable);
        assert_eq!(service.nodes[0].id, "greeter-1");
        assert_eq!(service.nodes[0].address, "10.1.2.3:7000");
        assert!(service.endpoints.iter().all(|e| !e.name.starts_with("Debug.")));
        assert_eq!(service.endpoints.len(), 1);
    }

    #[test]
    fn subscribe_without_broker_fails() {
        let server = server();
        let sub =
            new_subscriber("events").handler("On", |_ctx: Context, _p: Ping| async { Ok(()) });
        assert!(matches!(
            server.subscribe(sub),
            Err(ServerError::NoBroker(ref t)) if t == "events"
        ));
        assert!(matches!(
            server.subscribe(new_subscriber("")),
            Err(ServerError::Registration(RegistrationError::EmptyTopic))
        ));
    }

    #[test]
    fn node_metadata_carries_options() {
        let server = Server::new(
            ServerOptions::new("greeter")
                .with_advertise("svc.local:80")
                .with_metadata("zone", "eu"),
        );
        let (service, cacheable) = server.service();
        assert!(!cacheable);
        let md = &service.nodes[0].metadata;
        assert_eq!(md.get("zone").map(String::as_str), Some("eu"));
        assert_eq!(md.get("protocol").map(String::as_str), Some("grpc"));
        assert!(!md.contains_key("registry"));
    }

    #[tokio::test]
    async fn start_and_stop_without_collaborators() {
        let server = Server::new(ServerOptions::new("greeter").with_address("127.0.0.1:0"));
        server.start().await.unwrap();
        assert_eq!(server.state(), RunState::Started);
        assert!(server.local_addr().is_some());
        assert!(matches!(server.start().await, Err(ServerError::AlreadyStarted)));
        assert!(server.handle(&echo()).is_err());

        server.stop().await.unwrap();
        assert_eq!(server.state(), RunState::Stopped);
        assert!(!server.is_registered());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn injected_listener_is_used() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(ServerOptions::new("greeter").with_address("192.0.2.1:1"))
            .with_listener(listener);
        server.start().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        server.stop().await.unwrap();
    }

    #[test]
    fn zero_interval_disables_ticker() {
        assert!(ticker(Duration::ZERO).is_none());
    }
}
