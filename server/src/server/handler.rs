//! Handlers: named groups of unary and streaming methods.
//!
//! Methods are declared explicitly with typed closures. Each closure is
//! erased into an invoker at construction so dispatch never needs to know the
//! concrete request or reply types.

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::codec::{CodecError, Payload, short_type_name};
use crate::context::Context;
use crate::error::CallError;
use crate::registry::{Endpoint, Value};

use super::stream::Stream;

/// Erased unary invocation, the unit handler wrappers operate on.
pub type HandlerFunc = Arc<
    dyn Fn(Context, Request) -> BoxFuture<'static, Result<Box<dyn Payload>, CallError>>
        + Send
        + Sync,
>;

/// Erased streaming invocation.
pub type StreamFunc =
    Arc<dyn Fn(Context, Stream) -> BoxFuture<'static, Result<(), CallError>> + Send + Sync>;

/// Middleware around unary calls.
pub type HandlerWrapper = Arc<dyn Fn(HandlerFunc) -> HandlerFunc + Send + Sync>;

/// Middleware around streaming calls.
pub type StreamWrapper = Arc<dyn Fn(StreamFunc) -> StreamFunc + Send + Sync>;

/// Wraps `base` so that `wrappers[0]` runs outermost.
pub(crate) fn apply_wrappers<F>(base: F, wrappers: &[Arc<dyn Fn(F) -> F + Send + Sync>]) -> F {
    let mut f = base;
    for i in (0..wrappers.len()).rev() {
        f = wrappers[i](f);
    }
    f
}

/// A decoded unary request.
pub struct Request {
    pub(crate) service: String,
    pub(crate) method: String,
    pub(crate) content_type: String,
    pub(crate) body: Box<dyn Payload>,
}

impl Request {
    /// Builds a request, mostly useful for exercising wrappers directly.
    #[must_use]
    pub fn new(service: &str, method: &str, content_type: &str, body: Box<dyn Payload>) -> Self {
        Self {
            service: service.to_string(),
            method: method.to_string(),
            content_type: content_type.to_string(),
            body,
        }
    }

    /// Service name.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Method name.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// `Service.Method`.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }

    /// Negotiated content type.
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Decoded body.
    #[must_use]
    pub fn body(&self) -> &dyn Payload {
        self.body.as_ref()
    }

    /// Downcasts the body.
    #[must_use]
    pub fn body_as<T: 'static>(&self) -> Option<&T> {
        self.body.as_any().downcast_ref::<T>()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("service", &self.service)
            .field("method", &self.method)
            .field("content_type", &self.content_type)
            .field("body", &self.body.type_name())
            .finish()
    }
}

#[derive(Clone)]
pub(crate) enum MethodKind {
    Unary {
        new_request: fn() -> Box<dyn Payload>,
        handler: HandlerFunc,
    },
    Stream {
        handler: StreamFunc,
    },
}

/// One declared method.
#[derive(Clone)]
pub struct Method {
    pub(crate) name: String,
    pub(crate) request_type: &'static str,
    pub(crate) response_type: &'static str,
    pub(crate) kind: MethodKind,
}

impl Method {
    /// Method name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for streaming methods.
    #[must_use]
    pub fn is_stream(&self) -> bool {
        matches!(self.kind, MethodKind::Stream { .. })
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("request", &self.request_type)
            .field("response", &self.response_type)
            .field("stream", &self.is_stream())
            .finish()
    }
}

pub(crate) fn new_payload<T: Payload + Default>() -> Box<dyn Payload> {
    Box::new(T::default())
}

/// Registration options of a handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Excluded from registry advertisement.
    pub internal: bool,
    /// Extra endpoint metadata keyed by method name.
    pub metadata: HashMap<String, HashMap<String, String>>,
}

/// A named service and its methods.
#[derive(Clone)]
pub struct Handler {
    name: String,
    methods: Vec<Method>,
    options: HandlerOptions,
}

impl Handler {
    /// Starts a handler for service `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            options: HandlerOptions::default(),
        }
    }

    /// Declares a unary method.
    #[must_use]
    pub fn unary<Req, Resp, F, Fut>(mut self, method: &str, f: F) -> Self
    where
        Req: Payload + Default,
        Resp: Payload,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, CallError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: HandlerFunc = Arc::new(move |ctx: Context, req: Request| {
            let f = Arc::clone(&f);
            async move {
                let body = req
                    .body
                    .into_any()
                    .downcast::<Req>()
                    .map_err(|_| CallError::Codec(CodecError::InvalidMessage))?;
                let reply = f(ctx, *body).await?;
                Ok(Box::new(reply) as Box<dyn Payload>)
            }
            .boxed()
        });
        self.methods.push(Method {
            name: method.to_string(),
            request_type: short_type_name::<Req>(),
            response_type: short_type_name::<Resp>(),
            kind: MethodKind::Unary {
                new_request: new_payload::<Req>,
                handler,
            },
        });
        self
    }

    /// Declares a streaming method driving the raw bidirectional stream.
    #[must_use]
    pub fn stream<F, Fut>(mut self, method: &str, f: F) -> Self
    where
        F: Fn(Context, Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: StreamFunc = Arc::new(move |ctx: Context, stream: Stream| {
            let f = Arc::clone(&f);
            async move { f(ctx, stream).await }.boxed()
        });
        self.methods.push(Method {
            name: method.to_string(),
            request_type: "Stream",
            response_type: "Stream",
            kind: MethodKind::Stream { handler },
        });
        self
    }

    /// Marks the handler internal.
    #[must_use]
    pub fn internal(mut self, internal: bool) -> Self {
        self.options.internal = internal;
        self
    }

    /// Attaches endpoint metadata to `method`.
    #[must_use]
    pub fn endpoint_metadata(mut self, method: &str, key: &str, value: &str) -> Self {
        self.options
            .metadata
            .entry(method.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared methods, including ones the registrar will skip.
    #[must_use]
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// Registration options.
    #[must_use]
    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    /// Registry endpoints for every exported method.
    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.methods
            .iter()
            .filter(|m| super::service::is_exported(&m.name))
            .map(|m| {
                let mut metadata = self.options.metadata.get(&m.name).cloned().unwrap_or_default();
                if m.is_stream() {
                    metadata.insert("stream".to_string(), "true".to_string());
                }
                Endpoint {
                    name: format!("{}.{}", self.name, m.name),
                    request: Some(Value::of_type(m.request_type)),
                    response: Some(Value::of_type(m.response_type)),
                    metadata,
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .field("options", &self.options)
            .finish()
    }
}
