//! Bridges broker messages to subscriber handler functions.
//!
//! Every delivered message is decoded once per handler function and each
//! handler runs in its own task. All failures are collected into a single
//! [`SubscriberError`] so the broker can decide on redelivery.

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::{self, Event, SubscribeOptions};
use crate::codec::{Buffer, Message, MessageType, Payload, header_value, short_type_name};
use crate::context::Context;
use crate::error::CallError;
use crate::metadata::{self, Metadata};
use crate::registry::{Endpoint, Value};
use crate::util::drain::Drain;
use crate::util::panic;

use super::codecs::{Codecs, DEFAULT_SUBSCRIBER_CONTENT_TYPE};
use super::handler::{apply_wrappers, new_payload};

/// A decoded broker message handed to subscriber functions.
pub struct Publication {
    topic: String,
    content_type: String,
    payload: Box<dyn Payload>,
}

impl Publication {
    /// Builds a publication, mostly useful for exercising wrappers directly.
    #[must_use]
    pub fn new(topic: &str, content_type: &str, payload: Box<dyn Payload>) -> Self {
        Self {
            topic: topic.to_string(),
            content_type: content_type.to_string(),
            payload,
        }
    }

    /// Topic the message arrived on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Content type used to decode the payload.
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Decoded payload.
    #[must_use]
    pub fn payload(&self) -> &dyn Payload {
        self.payload.as_ref()
    }
}

impl std::fmt::Debug for Publication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publication")
            .field("topic", &self.topic)
            .field("content_type", &self.content_type)
            .field("payload", &self.payload.type_name())
            .finish()
    }
}

/// Erased subscriber invocation.
pub type SubscriberFunc =
    Arc<dyn Fn(Context, Publication) -> BoxFuture<'static, Result<(), CallError>> + Send + Sync>;

/// Middleware around subscriber invocations.
pub type SubscriberWrapper = Arc<dyn Fn(SubscriberFunc) -> SubscriberFunc + Send + Sync>;

#[derive(Clone)]
struct SubHandler {
    name: String,
    request_type: &'static str,
    new_request: fn() -> Box<dyn Payload>,
    invoke: SubscriberFunc,
}

/// Subscriber options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberOptions {
    /// Queue group shared with other instances.
    pub queue: Option<String>,
    /// Acknowledge automatically once handlers return.
    pub auto_ack: bool,
    /// Excluded from registry advertisement.
    pub internal: bool,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            queue: None,
            auto_ack: true,
            internal: false,
        }
    }
}

/// A topic and the functions invoked for each of its messages.
#[derive(Clone)]
pub struct Subscriber {
    topic: String,
    handlers: Vec<SubHandler>,
    options: SubscriberOptions,
}

impl Subscriber {
    /// Starts a subscriber for `topic`.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            handlers: Vec::new(),
            options: SubscriberOptions::default(),
        }
    }

    /// Adds a handler function decoding messages as `Req`.
    #[must_use]
    pub fn handler<Req, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        Req: Payload + Default,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let invoke: SubscriberFunc = Arc::new(move |ctx: Context, publication: Publication| {
            let f = Arc::clone(&f);
            async move {
                let body = publication
                    .payload
                    .into_any()
                    .downcast::<Req>()
                    .map_err(|_| CallError::Codec(crate::codec::CodecError::InvalidMessage))?;
                f(ctx, *body).await
            }
            .boxed()
        });
        self.handlers.push(SubHandler {
            name: name.to_string(),
            request_type: short_type_name::<Req>(),
            new_request: new_payload::<Req>,
            invoke,
        });
        self
    }

    /// Joins a queue group.
    #[must_use]
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.options.queue = Some(queue.into());
        self
    }

    /// Toggles automatic acknowledgement.
    #[must_use]
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.options.auto_ack = auto_ack;
        self
    }

    /// Marks the subscriber internal.
    #[must_use]
    pub fn internal(mut self, internal: bool) -> Self {
        self.options.internal = internal;
        self
    }

    /// Topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Options.
    #[must_use]
    pub fn options(&self) -> &SubscriberOptions {
        &self.options
    }

    /// Number of handler functions.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Broker options derived from the subscriber options.
    #[must_use]
    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            queue: self.options.queue.clone(),
            auto_ack: self.options.auto_ack,
        }
    }

    /// Registry endpoints, one per handler function.
    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.handlers
            .iter()
            .map(|h| Endpoint {
                name: h.name.clone(),
                request: Some(Value::of_type(h.request_type)),
                response: None,
                metadata: [
                    ("topic".to_string(), self.topic.clone()),
                    ("subscriber".to_string(), "true".to_string()),
                ]
                .into_iter()
                .collect(),
            })
            .collect()
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.topic)
            .field("handlers", &self.handlers.iter().map(|h| h.name.as_str()).collect::<Vec<_>>())
            .field("options", &self.options)
            .finish()
    }
}

/// Every handler failure for one delivered message.
#[derive(Debug, thiserror::Error)]
#[error("subscriber {topic}: {} handler(s) failed: {}", .errors.len(), join(.errors))]
pub struct SubscriberError {
    /// Topic of the failed message.
    pub topic: String,
    /// One entry per failed handler, in no particular order.
    pub errors: Vec<CallError>,
}

fn join(errors: &[CallError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Shared settings for subscriber dispatch.
#[derive(Clone, Default)]
pub struct SubHandlerOptions {
    /// Content-type table.
    pub codecs: Codecs,
    /// Wrappers, first registered outermost.
    pub wrappers: Vec<SubscriberWrapper>,
    /// Optional in-flight counter.
    pub drain: Option<Drain>,
    /// Parent of every handler context.
    pub shutdown: CancellationToken,
}

/// Builds the broker handler for `subscriber`.
#[must_use]
pub fn create_sub_handler(subscriber: Arc<Subscriber>, opts: SubHandlerOptions) -> broker::Handler {
    let opts = Arc::new(opts);
    Arc::new(move |event: Event| {
        let subscriber = Arc::clone(&subscriber);
        let opts = Arc::clone(&opts);
        async move {
            dispatch_event(&subscriber, &opts, event)
                .await
                .map_err(|e| Box::new(e) as broker::BoxError)
        }
        .boxed()
    })
}

/// Runs every handler of `subscriber` for one message.
///
/// # Errors
///
/// Returns all collected handler and decode failures.
pub async fn dispatch_event(
    subscriber: &Subscriber,
    opts: &SubHandlerOptions,
    event: Event,
) -> Result<(), SubscriberError> {
    let _guard = opts.drain.as_ref().map(Drain::enter);
    let topic = event.topic.clone();
    let fail = |errors: Vec<CallError>| {
        metrics::counter!(
            "vine_subscriber_messages_total",
            "topic" => topic.clone(),
            "outcome" => "error"
        )
        .increment(1);
        SubscriberError {
            topic: topic.clone(),
            errors,
        }
    };

    let content_type = header_value(&event.message.header, "Content-Type")
        .unwrap_or(DEFAULT_SUBSCRIBER_CONTENT_TYPE)
        .to_string();
    let new_codec = match opts.codecs.new_codec(&content_type) {
        Ok(new_codec) => new_codec,
        Err(e) => return Err(fail(vec![e.into()])),
    };

    let mut md: Metadata = event.message.header.clone().into();
    md.remove(metadata::CONTENT_TYPE_HEADER);
    let ctx = Context::new(md).with_parent(&opts.shutdown);

    let mut errors: Vec<CallError> = Vec::new();
    let mut tasks = JoinSet::new();
    for handler in &subscriber.handlers {
        let mut codec = new_codec(Box::new(Buffer::new(event.message.body.clone())));
        let mut msg = Message {
            kind: MessageType::Event,
            target: topic.clone(),
            header: event.message.header.clone(),
            ..Message::default()
        };
        let mut body = (handler.new_request)();
        let decoded = async {
            codec.read_header(&mut msg, MessageType::Event).await?;
            codec.read_body(Some(body.as_mut())).await
        }
        .await;
        if let Err(e) = decoded {
            debug!(topic = %topic, handler = %handler.name, error = %e, "failed to decode message");
            errors.push(e.into());
            continue;
        }

        let f = apply_wrappers(Arc::clone(&handler.invoke), &opts.wrappers);
        let publication = Publication::new(&topic, &content_type, body);
        let ctx = ctx.clone();
        tasks.spawn(panic::guard(async move { f(ctx, publication).await }));
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(e),
            Err(e) => errors.push(CallError::Other(anyhow::anyhow!("subscriber task failed: {e}"))),
        }
    }

    if errors.is_empty() {
        metrics::counter!(
            "vine_subscriber_messages_total",
            "topic" => topic.clone(),
            "outcome" => "ok"
        )
        .increment(1);
        Ok(())
    } else {
        warn!(topic = %topic, failed = errors.len(), "subscriber handlers failed");
        Err(fail(errors))
    }
}
