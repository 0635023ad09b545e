//! The single entry point every call on the shared transport goes through.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, warn};

use crate::codec::grpc::ENDPOINT_HEADER;
use crate::codec::{CodecError, Payload};
use crate::context::Context;
use crate::error::CallError;
use crate::metadata::{Metadata, Negotiation};
use crate::util::drain::Drain;
use crate::util::panic;

use super::codecs::{Codecs, DEFAULT_CONTENT_TYPE};
use super::handler::{
    HandlerFunc, HandlerWrapper, MethodKind, Request, StreamWrapper, apply_wrappers,
};
use super::router::{self, Router};
use super::service::ServiceTable;
use super::stream::{CallInfo, FrameReader, FrameWriter, Stream};

/// One inbound call as handed over by the transport.
pub struct Call {
    /// Request path, `/pkg.Service/Method` or `Service.Method`.
    pub path: String,
    /// Metadata with transport headers removed.
    pub metadata: Metadata,
    /// What the transport headers negotiated.
    pub negotiation: Negotiation,
    /// Inbound frames.
    pub reader: Box<dyn FrameReader>,
    /// Outbound frames.
    pub writer: Box<dyn FrameWriter>,
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("path", &self.path)
            .field("metadata", &self.metadata)
            .field("negotiation", &self.negotiation)
            .finish_non_exhaustive()
    }
}

/// Splits a method path into service and method.
///
/// `/pkg.Service/Method` yields `Service` (last dot segment) and `Method`;
/// the non gRPC form is `Service.Method`.
///
/// # Errors
///
/// Returns [`CallError::MalformedMethod`] for anything else.
pub fn service_method(path: &str) -> Result<(String, String), CallError> {
    let malformed = || CallError::MalformedMethod(path.to_string());
    if let Some(rest) = path.strip_prefix('/') {
        let (qualified, method) = rest.split_once('/').ok_or_else(malformed)?;
        let service = qualified.rsplit('.').next().unwrap_or_default();
        if service.is_empty() || method.is_empty() || method.contains('/') {
            return Err(malformed());
        }
        return Ok((service.to_string(), method.to_string()));
    }
    match path.split_once('.') {
        Some((service, method))
            if !service.is_empty() && !method.is_empty() && !method.contains('.') =>
        {
            Ok((service.to_string(), method.to_string()))
        }
        _ => Err(malformed()),
    }
}

/// Routes calls to the frozen method table or to a generic router.
#[derive(Clone)]
pub struct Dispatcher {
    table: Arc<ServiceTable>,
    codecs: Codecs,
    router: Option<Arc<dyn Router>>,
    handler_wrappers: Vec<HandlerWrapper>,
    stream_wrappers: Vec<StreamWrapper>,
    drain: Option<Drain>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Dispatcher over `table` with the built-in codecs.
    #[must_use]
    pub fn new(table: Arc<ServiceTable>) -> Self {
        Self {
            table,
            codecs: Codecs::default(),
            router: None,
            handler_wrappers: Vec::new(),
            stream_wrappers: Vec::new(),
            drain: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Replaces the content-type table.
    #[must_use]
    pub fn with_codecs(mut self, codecs: Codecs) -> Self {
        self.codecs = codecs;
        self
    }

    /// Sends every call through `router`.
    #[must_use]
    pub fn with_router(mut self, router: Option<Arc<dyn Router>>) -> Self {
        self.router = router;
        self
    }

    /// Wrappers for unary and streaming calls.
    #[must_use]
    pub fn with_wrappers(
        mut self,
        handler: Vec<HandlerWrapper>,
        stream: Vec<StreamWrapper>,
    ) -> Self {
        self.handler_wrappers = handler;
        self.stream_wrappers = stream;
        self
    }

    /// Counts every call in `drain`.
    #[must_use]
    pub fn with_drain(mut self, drain: Option<Drain>) -> Self {
        self.drain = drain;
        self
    }

    /// Parent token of every call context.
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Serves one call to completion. The result is the call's status.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the call.
    pub async fn dispatch(&self, call: Call) -> Result<(), CallError> {
        let _guard = self.drain.as_ref().map(Drain::enter);
        let started = Instant::now();

        let target = if call.path.trim_matches('/').is_empty() {
            call.metadata.get(ENDPOINT_HEADER).unwrap_or_default().to_string()
        } else {
            call.path.clone()
        };
        let (service, method) = match service_method(&target) {
            Ok(parts) => parts,
            Err(e) => {
                record_call("", "", Err(&e), started.elapsed());
                return Err(e);
            }
        };

        let span = debug_span!("rpc", service = %service, method = %method);
        let result = self
            .serve(service.clone(), method.clone(), call)
            .instrument(span)
            .await;
        record_call(&service, &method, result.as_ref().map(|_| ()), started.elapsed());
        result
    }

    async fn serve(&self, service: String, method: String, call: Call) -> Result<(), CallError> {
        let content_type = call
            .negotiation
            .content_type
            .clone()
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let marshaler = self.codecs.marshaler(&content_type)?;

        let ctx = Context::new(call.metadata)
            .with_timeout(call.negotiation.timeout)
            .with_parent(&self.shutdown);
        let _cancel_on_exit = ctx.token().clone().drop_guard();

        let resolved = self.table.lookup(&service, &method);
        let info = CallInfo {
            service,
            method,
            content_type,
        };
        let stream = Stream::new(info, ctx.clone(), marshaler, call.reader, call.writer);

        if let Some(router) = &self.router {
            let is_stream = resolved.as_ref().is_ok_and(|m| m.is_stream());
            let (ctx, req, rsp) = router::split(stream, is_stream);
            let router = Arc::clone(router);
            let guard_ctx = ctx.clone();
            return run_guarded(&guard_ctx, async move { router.serve_request(ctx, req, rsp).await })
                .await;
        }

        let method = resolved?;
        match &method.kind {
            MethodKind::Unary {
                new_request,
                handler,
            } => self.unary(ctx, stream, *new_request, Arc::clone(handler)).await,
            MethodKind::Stream { handler } => {
                let f = apply_wrappers(Arc::clone(handler), &self.stream_wrappers);
                run_guarded(&ctx, f(ctx.clone(), stream)).await
            }
        }
    }

    async fn unary(
        &self,
        ctx: Context,
        mut stream: Stream,
        new_request: fn() -> Box<dyn Payload>,
        handler: HandlerFunc,
    ) -> Result<(), CallError> {
        let frame = stream
            .recv_raw()
            .await?
            .ok_or(CallError::Codec(CodecError::UnexpectedEof))?;
        let mut body = new_request();
        stream.marshaler().unmarshal(&frame, body.as_mut())?;

        let info = stream.info();
        let request = Request::new(&info.service, &info.method, &info.content_type, body);
        let f = apply_wrappers(handler, &self.handler_wrappers);
        let reply = run_guarded(&ctx, f(ctx.clone(), request)).await?;
        stream.send(reply.as_ref()).await
    }
}

/// Runs a handler future under the panic guard and the call deadline.
async fn run_guarded<T>(
    ctx: &Context,
    fut: impl Future<Output = Result<T, CallError>>,
) -> Result<T, CallError> {
    let remaining = ctx.remaining();
    let token = ctx.token().clone();
    panic::guard(async move {
        match remaining {
            Some(remaining) => match tokio::time::timeout(remaining, fut).await {
                Ok(result) => result,
                Err(_) => {
                    token.cancel();
                    Err(CallError::DeadlineExceeded)
                }
            },
            None => fut.await,
        }
    })
    .await
}

fn record_call(service: &str, method: &str, result: Result<(), &CallError>, elapsed: Duration) {
    let code = match result {
        Ok(()) => tonic::Code::Ok,
        Err(e) => e.code(),
    };
    match result {
        Err(e) if matches!(code, tonic::Code::Internal | tonic::Code::Unknown) => {
            warn!(service, method, code = ?code, error = %e, "call failed");
        }
        Err(e) => debug!(service, method, code = ?code, error = %e, "call returned error"),
        Ok(()) => {}
    }
    metrics::counter!(
        "vine_rpc_requests_total",
        "service" => service.to_string(),
        "method" => method.to_string(),
        "code" => format!("{code:?}")
    )
    .increment(1);
    metrics::histogram!(
        "vine_rpc_request_duration_seconds",
        "service" => service.to_string(),
        "method" => method.to_string()
    )
    .record(elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Marshaler, json::JsonMarshaler, proto::ProtoMarshaler};
    use crate::error::RpcError;
    use crate::server::handler::Handler;
    use crate::server::router::{RpcRequest, RpcResponse};
    use crate::server::service::Registrar;
    use crate::server::stream::{MemoryReader, MemoryWriter};
    use async_trait::async_trait;
    use bytes::Bytes;

    #[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
    #[serde(default)]
    struct StringReq {
        #[prost(string, tag = "1")]
        value: String,
    }

    #[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
    #[serde(default)]
    struct StringResp {
        #[prost(string, tag = "1")]
        value: String,
    }

    fn dispatcher() -> Dispatcher {
        let greeter = Handler::new("Greeter")
            .unary("Echo", |_ctx, req: StringReq| async move {
                Ok(StringResp { value: req.value })
            })
            .unary("Boom", |_ctx, _req: StringReq| async move {
                if true {
                    panic!("boom");
                }
                Ok(StringResp::default())
            })
            .unary("Missing", |_ctx, req: StringReq| async move {
                Err::<StringResp, _>(RpcError::not_found("greeter", req.value).into())
            })
            .unary("Slow", |_ctx, req: StringReq| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(StringResp { value: req.value })
            })
            .stream("Count", |_ctx, mut stream| async move {
                let mut n = 0;
                while let Some(req) = stream.recv::<StringReq>().await? {
                    n += 1;
                    stream.send(&StringResp { value: format!("{n}:{}", req.value) }).await?;
                }
                Ok(())
            });
        let mut registrar = Registrar::new();
        registrar.register(&greeter).unwrap();
        Dispatcher::new(registrar.snapshot())
    }

    fn call(path: &str, content_type: &str, frames: Vec<Bytes>) -> (Call, MemoryWriter) {
        let writer = MemoryWriter::new();
        let call = Call {
            path: path.to_string(),
            metadata: Metadata::new(),
            negotiation: Negotiation {
                content_type: Some(content_type.to_string()),
                ..Negotiation::default()
            },
            reader: Box::new(MemoryReader::new(frames)),
            writer: Box::new(writer.clone()),
        };
        (call, writer)
    }

    fn encode(m: &dyn Marshaler, value: &dyn Payload) -> Bytes {
        Bytes::from(m.marshal(value).unwrap())
    }

    fn proto_call(path: &str, value: &str) -> (Call, MemoryWriter) {
        let req = StringReq { value: value.into() };
        call(path, "application/grpc", vec![encode(&ProtoMarshaler, &req)])
    }

    #[tokio::test]
    async fn unary_round_trip_for_proto_and_json() {
        let d = dispatcher();
        for (ct, m) in [
            ("application/grpc", &ProtoMarshaler as &dyn Marshaler),
            ("application/grpc+json", &JsonMarshaler as &dyn Marshaler),
        ] {
            let req = StringReq { value: "abc".into() };
            let (c, writer) = call("/demo.Greeter/Echo", ct, vec![encode(m, &req)]);
            d.dispatch(c).await.unwrap();

            let frames = writer.captured().frames;
            assert_eq!(frames.len(), 1, "{ct}");
            let mut resp = StringResp::default();
            m.unmarshal(&frames[0], &mut resp).unwrap();
            assert_eq!(resp.value, "abc");
        }
    }

    #[tokio::test]
    async fn panic_is_isolated_to_its_call() {
        let d = dispatcher();
        let (c, _) = proto_call("/demo.Greeter/Boom", "");
        let err = d.dispatch(c).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);

        let (c, writer) = proto_call("Greeter.Echo", "still up");
        d.dispatch(c).await.unwrap();
        assert_eq!(writer.captured().frames.len(), 1);
    }

    #[tokio::test]
    async fn resolution_failures_are_classified() {
        let d = dispatcher();
        let (c, _) = call("/demo.Nobody/Echo", "application/grpc", vec![]);
        assert_eq!(d.dispatch(c).await.unwrap_err().code(), tonic::Code::Unimplemented);

        let (c, _) = call("/demo.Greeter/Nothing", "application/grpc", vec![]);
        assert_eq!(d.dispatch(c).await.unwrap_err().code(), tonic::Code::Unimplemented);

        let (c, _) = call("not-a-method", "application/grpc", vec![]);
        assert_eq!(d.dispatch(c).await.unwrap_err().code(), tonic::Code::InvalidArgument);

        let (c, _) = call("/demo.Greeter/Echo", "text/plain", vec![]);
        let err = d.dispatch(c).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
        assert_eq!(err.to_string(), "unsupported Content-Type: text/plain");
    }

    #[tokio::test]
    async fn typed_handler_error_keeps_its_code() {
        let d = dispatcher();
        let (c, _) = proto_call("/demo.Greeter/Missing", "bob");
        let status = d.dispatch(c).await.unwrap_err().to_status();
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert_eq!(RpcError::parse(status.message()).detail, "bob");
    }

    #[tokio::test]
    async fn unrepresentable_timeout_runs_without_deadline() {
        let d = dispatcher();
        let (mut c, writer) = proto_call("/demo.Greeter/Echo", "patient");
        c.negotiation.timeout = Some(Duration::MAX);
        d.dispatch(c).await.unwrap();
        assert_eq!(writer.captured().frames.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_header_sets_a_deadline() {
        let d = dispatcher();
        let (mut c, _) = proto_call("/demo.Greeter/Slow", "");
        c.negotiation.timeout = Some(Duration::from_millis(50));
        assert!(matches!(d.dispatch(c).await, Err(CallError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn streaming_method_drives_the_stream() {
        let d = dispatcher();
        let frames = ["a", "b"]
            .iter()
            .map(|v| encode(&JsonMarshaler, &StringReq { value: (*v).to_string() }))
            .collect();
        let (c, writer) = call("/demo.Greeter/Count", "application/grpc+json", frames);
        d.dispatch(c).await.unwrap();
        assert_eq!(
            writer.captured().frames,
            vec![
                Bytes::from_static(br#"{"value":"1:a"}"#),
                Bytes::from_static(br#"{"value":"2:b"}"#),
            ]
        );
    }

    #[tokio::test]
    async fn wrappers_see_every_unary_call() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorder: HandlerWrapper = {
            let seen = Arc::clone(&seen);
            Arc::new(move |next: HandlerFunc| -> HandlerFunc {
                let seen = Arc::clone(&seen);
                Arc::new(move |ctx: Context, req: Request| {
                    seen.lock().push(req.endpoint());
                    next(ctx, req)
                })
            })
        };
        let d = dispatcher().with_wrappers(vec![recorder], Vec::new());
        let (c, _) = proto_call("/demo.Greeter/Echo", "");
        d.dispatch(c).await.unwrap();
        assert_eq!(*seen.lock(), vec!["Greeter.Echo".to_string()]);
    }

    struct Reverse;

    #[async_trait]
    impl Router for Reverse {
        async fn serve_request(
            &self,
            _ctx: Context,
            mut req: RpcRequest,
            mut rsp: RpcResponse,
        ) -> Result<(), CallError> {
            let mut body = StringReq::default();
            req.read(&mut body).await?;
            rsp.write_header("x-routed", req.endpoint().as_str());
            rsp.write(&StringResp {
                value: body.value.chars().rev().collect(),
            })
            .await
        }
    }

    #[tokio::test]
    async fn router_receives_calls_for_unknown_services() {
        let d = dispatcher().with_router(Some(Arc::new(Reverse)));
        let body = encode(&JsonMarshaler, &StringReq { value: "abc".into() });
        let (c, writer) = call("/any.Proxy/Forward", "application/json", vec![body]);
        d.dispatch(c).await.unwrap();
        let captured = writer.captured();
        assert_eq!(captured.frames, vec![Bytes::from_static(br#"{"value":"cba"}"#)]);
        assert_eq!(captured.headers, vec![("x-routed".to_string(), "Proxy.Forward".to_string())]);
    }

    #[test]
    fn method_paths_parse() {
        assert_eq!(
            service_method("/go.vine.Greeter/Hello").unwrap(),
            ("Greeter".to_string(), "Hello".to_string())
        );
        assert_eq!(
            service_method("Greeter.Hello").unwrap(),
            ("Greeter".to_string(), "Hello".to_string())
        );
        for bad in ["", "/", "/Greeter", "/Greeter/", "Greeter", "a.b.c", "/x/y/z"] {
            assert!(matches!(service_method(bad), Err(CallError::MalformedMethod(_))), "{bad}");
        }
    }
}
