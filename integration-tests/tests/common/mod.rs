//! Shared test utilities for integration tests.
//!
//! In-memory registry and broker doubles with failure injection, plus the
//! payload type the tests exchange.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use vine_server::broker::{
    BoxError, Broker, BrokerError, BrokerMessage, Event, Handler, SubscribeOptions, Subscription,
};
use vine_server::registry::{RegisterOptions, Registry, RegistryError, Service};

/// Request and event payload used across tests.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Note {
    /// Free text.
    #[prost(string, tag = "1")]
    pub text: String,
    /// Sequence number.
    #[prost(uint32, tag = "2")]
    pub seq: u32,
}

/// Registry double storing services by name.
#[derive(Default)]
pub struct MemoryRegistry {
    services: Mutex<HashMap<String, Service>>,
    options: Mutex<Vec<RegisterOptions>>,
    register_attempts: AtomicU32,
    deregister_attempts: AtomicU32,
    fail_register: AtomicU32,
    fail_deregister: AtomicU32,
}

impl MemoryRegistry {
    /// A shared empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails the next `n` register calls as unavailable.
    pub fn fail_next_registers(&self, n: u32) {
        self.fail_register.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` deregister calls as unavailable.
    pub fn fail_next_deregisters(&self, n: u32) {
        self.fail_deregister.store(n, Ordering::SeqCst);
    }

    /// Currently registered entry for `name`.
    pub fn service(&self, name: &str) -> Option<Service> {
        self.services.lock().get(name).cloned()
    }

    /// Options of every successful registration, in order.
    pub fn register_options(&self) -> Vec<RegisterOptions> {
        self.options.lock().clone()
    }

    /// Register calls, failed ones included.
    pub fn register_attempts(&self) -> u32 {
        self.register_attempts.load(Ordering::SeqCst)
    }

    /// Deregister calls, failed ones included.
    pub fn deregister_attempts(&self) -> u32 {
        self.deregister_attempts.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(
        &self,
        service: &Service,
        opts: RegisterOptions,
    ) -> Result<(), RegistryError> {
        self.register_attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_register) {
            return Err(RegistryError::Unavailable("injected".into()));
        }
        self.services.lock().insert(service.name.clone(), service.clone());
        self.options.lock().push(opts);
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<(), RegistryError> {
        self.deregister_attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_deregister) {
            return Err(RegistryError::Unavailable("injected".into()));
        }
        self.services.lock().remove(&service.name);
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>, RegistryError> {
        self.service(name)
            .map(|s| vec![s])
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[derive(Default)]
struct Topics {
    next: AtomicU64,
    handlers: Mutex<HashMap<u64, (String, Handler)>>,
}

/// Broker double delivering published messages in process.
#[derive(Default)]
pub struct MemoryBroker {
    topics: Arc<Topics>,
    connects: AtomicU32,
    disconnects: AtomicU32,
    subscribes: AtomicU32,
    unsubscribes: Arc<AtomicU32>,
    fail_topic: Mutex<Option<String>>,
    subscribe_delay: Mutex<Option<Duration>>,
}

impl MemoryBroker {
    /// A shared broker without subscriptions.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every subscribe to `topic` fail.
    pub fn fail_subscribe(&self, topic: &str) {
        *self.fail_topic.lock() = Some(topic.to_string());
    }

    /// Makes every subscribe take `delay` before it completes.
    pub fn slow_subscribe(&self, delay: Duration) {
        *self.subscribe_delay.lock() = Some(delay);
    }

    /// Lets subscribes succeed again.
    pub fn heal(&self) {
        *self.fail_topic.lock() = None;
    }

    /// Live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.handlers.lock().values().filter(|(t, _)| t == topic).count()
    }

    /// `connect` calls.
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// `disconnect` calls.
    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Successful `subscribe` calls.
    pub fn subscribes(&self) -> u32 {
        self.subscribes.load(Ordering::SeqCst)
    }

    /// `unsubscribe` calls.
    pub fn unsubscribes(&self) -> u32 {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    /// Delivers `message` to every handler on `topic`, returning each result.
    pub async fn deliver(&self, topic: &str, message: BrokerMessage) -> Vec<Result<(), BoxError>> {
        let handlers: Vec<Handler> = self
            .topics
            .handlers
            .lock()
            .values()
            .filter(|(t, _)| t == topic)
            .map(|(_, h)| Arc::clone(h))
            .collect();
        let mut results = Vec::new();
        for handler in handlers {
            let event = Event {
                topic: topic.to_string(),
                message: message.clone(),
            };
            results.push(handler(event).await);
        }
        results
    }
}

struct MemorySubscription {
    id: u64,
    topic: String,
    options: SubscribeOptions,
    topics: Arc<Topics>,
    unsubscribes: Arc<AtomicU32>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    async fn unsubscribe(&self) -> Result<(), BrokerError> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.topics.handlers.lock().remove(&self.id);
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Handler,
        opts: SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let delay = *self.subscribe_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_topic.lock().as_deref() == Some(topic) {
            return Err(BrokerError::Subscribe {
                topic: topic.to_string(),
                reason: "injected".into(),
            });
        }
        let id = self.topics.next.fetch_add(1, Ordering::SeqCst);
        self.topics.handlers.lock().insert(id, (topic.to_string(), handler));
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySubscription {
            id,
            topic: topic.to_string(),
            options: opts,
            topics: Arc::clone(&self.topics),
            unsubscribes: Arc::clone(&self.unsubscribes),
        }))
    }

    async fn publish(&self, topic: &str, message: &BrokerMessage) -> Result<(), BrokerError> {
        for result in self.deliver(topic, message.clone()).await {
            result.map_err(|e| BrokerError::Publish(e.to_string()))?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }

    fn address(&self) -> String {
        "memory://local".to_string()
    }
}

/// A message with a protobuf body.
pub fn proto_message(note: &Note) -> BrokerMessage {
    BrokerMessage {
        header: HashMap::from([("Content-Type".to_string(), "application/protobuf".to_string())]),
        body: prost::Message::encode_to_vec(note),
    }
}

/// A message with a JSON body and one extra header.
pub fn json_message(note: &Note, key: &str, value: &str) -> BrokerMessage {
    BrokerMessage {
        header: HashMap::from([
            ("Content-Type".to_string(), "application/json".to_string()),
            (key.to_string(), value.to_string()),
        ]),
        body: serde_json::to_vec(note).unwrap_or_default(),
    }
}
