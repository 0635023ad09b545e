//! Pub/sub collaborator used by subscribers.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

/// Error type returned by broker handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors reported by a broker implementation.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Operation attempted before `connect`.
    #[error("broker not connected")]
    NotConnected,
    /// Connecting failed.
    #[error("broker connect: {0}")]
    Connect(String),
    /// Subscribing or unsubscribing failed.
    #[error("broker subscribe {topic}: {reason}")]
    Subscribe {
        /// Topic involved.
        topic: String,
        /// Failure description.
        reason: String,
    },
    /// Publishing failed.
    #[error("broker publish: {0}")]
    Publish(String),
}

/// A message on the wire: headers plus an encoded body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Headers, including `Content-Type`.
    pub header: HashMap<String, String>,
    /// Encoded body.
    pub body: Vec<u8>,
}

/// A delivered message.
#[derive(Debug, Clone)]
pub struct Event {
    /// Topic the message was published on.
    pub topic: String,
    /// The message.
    pub message: BrokerMessage,
}

/// Called for every delivered message. An error requests redelivery.
pub type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Subscription options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Queue group sharing the topic, when set.
    pub queue: Option<String>,
    /// Acknowledge automatically after the handler returns.
    pub auto_ack: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            queue: None,
            auto_ack: true,
        }
    }
}

/// A live subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Topic subscribed to.
    fn topic(&self) -> &str;

    /// Options the subscription was created with.
    fn options(&self) -> &SubscribeOptions;

    /// Stops delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker could not remove the subscription.
    async fn unsubscribe(&self) -> Result<(), BrokerError>;
}

/// Pub/sub backend.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens the connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connect`] on failure.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection could not be closed cleanly.
    async fn disconnect(&self) -> Result<(), BrokerError>;

    /// Subscribes `handler` to `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Subscribe`] on failure.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Handler,
        opts: SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Publishes a message.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Publish`] on failure.
    async fn publish(&self, topic: &str, message: &BrokerMessage) -> Result<(), BrokerError>;

    /// Implementation name, advertised in node metadata.
    fn name(&self) -> &str;

    /// Address of the broker endpoint.
    fn address(&self) -> String;
}
