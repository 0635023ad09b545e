//! HTTP/2 transport: funnels every gRPC request into the dispatcher and lets
//! everything else fall through to the auxiliary mux.

use async_trait::async_trait;
use axum::body::{Body, BodyDataStream, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::serve::Listener;
use futures_util::StreamExt;
use http_body::Frame as BodyFrame;
use http_body_util::StreamBody;
use parking_lot::Mutex;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use std::convert::Infallible;
use std::fmt::Debug;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::codec::frame::encode_frame;
use crate::codec::{CodecError, FrameDecoder};
use crate::error::CallError;
use crate::metadata;

use super::codecs::DEFAULT_CONTENT_TYPE;
use super::dispatch::{Call, Dispatcher};
use super::stream::{FrameReader, FrameWriter};

const GRPC_STATUS_HEADER: &str = "grpc-status";
const GRPC_MESSAGE_HEADER: &str = "grpc-message";

/// True for `application/grpc` and its `+proto` / `+json` variants.
#[must_use]
pub fn is_grpc(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with(DEFAULT_CONTENT_TYPE))
}

#[derive(Clone)]
struct TransportState {
    dispatcher: Arc<Dispatcher>,
    max_msg_size: usize,
}

/// Layers content-type sniffing over `aux` so gRPC traffic reaches the
/// dispatcher regardless of path.
pub fn app(dispatcher: Arc<Dispatcher>, max_msg_size: usize, aux: axum::Router) -> axum::Router {
    let state = TransportState {
        dispatcher,
        max_msg_size,
    };
    aux.layer(middleware::from_fn_with_state(state, sniff))
}

async fn sniff(State(state): State<TransportState>, req: Request, next: Next) -> Response {
    if is_grpc(req.headers()) {
        serve_call(state, req).await
    } else {
        next.run(req).await
    }
}

async fn serve_call(state: TransportState, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let (metadata, negotiation) = metadata::from_headers(&parts.headers);

    let content_type = negotiation
        .transport_content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    let mut initial = HeaderMap::new();
    initial.insert(header::CONTENT_TYPE, content_type);

    let (frames_tx, frames_rx) = mpsc::channel(16);
    let (head_tx, head_rx) = oneshot::channel();
    let sink = ResponseSink {
        state: Arc::new(Mutex::new(SinkState {
            head: Some(head_tx),
            headers: initial,
        })),
        frames: frames_tx,
        max_msg_size: state.max_msg_size,
    };
    let call = Call {
        path: parts.uri.path().to_string(),
        metadata,
        negotiation,
        reader: Box::new(Http2Reader {
            body: body.into_data_stream(),
            decoder: FrameDecoder::new(state.max_msg_size),
            eof: false,
        }),
        writer: Box::new(sink.clone()),
    };

    let dispatcher = Arc::clone(&state.dispatcher);
    tokio::spawn(async move {
        let status = match dispatcher.dispatch(call).await {
            Ok(()) => tonic::Status::new(tonic::Code::Ok, ""),
            Err(e) => e.to_status(),
        };
        sink.finish(&status).await;
    });

    let headers = match head_rx.await {
        Ok(headers) => headers,
        Err(_) => trailers(&tonic::Status::internal("call task ended without response")),
    };
    let stream = futures_util::stream::unfold(frames_rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok::<_, Infallible>(frame), rx))
    });
    let mut response = Response::new(Body::new(StreamBody::new(stream)));
    *response.headers_mut() = headers;
    response
}

/// Bytes escaped in `grpc-message`: controls and `%`. Non-ASCII is always
/// escaped by `utf8_percent_encode`.
const GRPC_MESSAGE: &AsciiSet = &CONTROLS.add(b'%');

fn trailers(status: &tonic::Status) -> HeaderMap {
    let mut map = HeaderMap::new();
    map.insert(GRPC_STATUS_HEADER, HeaderValue::from(status.code() as i32));
    if !status.message().is_empty() {
        let message = utf8_percent_encode(status.message(), GRPC_MESSAGE).to_string();
        if let Ok(value) = HeaderValue::from_str(&message) {
            map.insert(GRPC_MESSAGE_HEADER, value);
        }
    }
    map
}

struct Http2Reader {
    body: BodyDataStream,
    decoder: FrameDecoder,
    eof: bool,
}

#[async_trait]
impl FrameReader for Http2Reader {
    async fn recv_frame(&mut self) -> Result<Option<Bytes>, CallError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                if frame.compressed {
                    return Err(CodecError::Compressed.into());
                }
                return Ok(Some(frame.payload));
            }
            if self.eof {
                if self.decoder.has_partial() {
                    return Err(CodecError::UnexpectedEof.into());
                }
                return Ok(None);
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.decoder.push(&chunk),
                Some(Err(e)) => return Err(CallError::Io(io::Error::other(e))),
                None => self.eof = true,
            }
        }
    }
}

struct SinkState {
    head: Option<oneshot::Sender<HeaderMap>>,
    headers: HeaderMap,
}

/// Response side of one call. The head is released with the first message
/// or with the trailers, whichever comes first.
#[derive(Clone)]
struct ResponseSink {
    state: Arc<Mutex<SinkState>>,
    frames: mpsc::Sender<BodyFrame<Bytes>>,
    max_msg_size: usize,
}

impl ResponseSink {
    fn flush_head(&self) {
        let mut state = self.state.lock();
        if let Some(tx) = state.head.take() {
            let headers = std::mem::take(&mut state.headers);
            let _ = tx.send(headers);
        }
    }

    async fn finish(&self, status: &tonic::Status) {
        self.flush_head();
        // The client may already be gone; there is nobody left to tell.
        let _ = self.frames.send(BodyFrame::trailers(trailers(status))).await;
    }
}

#[async_trait]
impl FrameWriter for ResponseSink {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), CallError> {
        if frame.len() > self.max_msg_size {
            return Err(CodecError::MessageTooLarge {
                size: frame.len(),
                max: self.max_msg_size,
            }
            .into());
        }
        self.flush_head();
        let data = encode_frame(&frame)?;
        self.frames
            .send(BodyFrame::data(data))
            .await
            .map_err(|_| CallError::Io(io::Error::from(io::ErrorKind::BrokenPipe)))
    }

    fn set_header(&mut self, key: &str, value: &str) {
        let mut state = self.state.lock();
        if state.head.is_none() {
            return;
        }
        let parsed = (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(value));
        if let (Ok(name), Ok(value)) = parsed {
            state.headers.insert(name, value);
        }
    }
}

/// Caps the number of concurrently open connections.
#[derive(Debug)]
pub struct LimitListener<L> {
    inner: L,
    permits: Arc<Semaphore>,
}

impl<L> LimitListener<L> {
    /// Allows at most `max` open connections on `inner`.
    #[must_use]
    pub fn new(inner: L, max: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max)),
        }
    }
}

impl<L: Listener> Listener for LimitListener<L> {
    type Io = LimitedIo<L::Io>;
    type Addr = L::Addr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok();
        let (io, addr) = self.inner.accept().await;
        (LimitedIo { io, _permit: permit }, addr)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// A connection holding one of the listener's permits until closed.
#[derive(Debug)]
pub struct LimitedIo<T> {
    io: T,
    _permit: Option<OwnedSemaphorePermit>,
}

impl<T: AsyncRead + Unpin> AsyncRead for LimitedIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for LimitedIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

/// Serves `app` until `shutdown` fires and open connections finish.
///
/// # Errors
///
/// Returns the listener's I/O error.
pub async fn serve<L>(listener: L, app: axum::Router, shutdown: CancellationToken) -> io::Result<()>
where
    L: Listener,
    L::Addr: Debug,
{
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sink() -> (
        ResponseSink,
        oneshot::Receiver<HeaderMap>,
        mpsc::Receiver<BodyFrame<Bytes>>,
    ) {
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let (head_tx, head_rx) = oneshot::channel();
        let sink = ResponseSink {
            state: Arc::new(Mutex::new(SinkState {
                head: Some(head_tx),
                headers: HeaderMap::new(),
            })),
            frames: frames_tx,
            max_msg_size: 16,
        };
        (sink, head_rx, frames_rx)
    }

    #[test]
    fn only_grpc_content_types_are_sniffed() {
        let mut headers = HeaderMap::new();
        assert!(!is_grpc(&headers));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/grpc+json"));
        assert!(is_grpc(&headers));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert!(!is_grpc(&headers));
    }

    #[tokio::test]
    async fn reader_reassembles_frames_across_chunks() {
        let mut wire = encode_frame(b"first").unwrap().to_vec();
        wire.extend_from_slice(&encode_frame(b"second").unwrap());
        let mut reader = Http2Reader {
            body: Body::from(wire).into_data_stream(),
            decoder: FrameDecoder::new(64),
            eof: false,
        };
        assert_eq!(reader.recv_frame().await.unwrap(), Some(Bytes::from_static(b"first")));
        assert_eq!(reader.recv_frame().await.unwrap(), Some(Bytes::from_static(b"second")));
        assert_eq!(reader.recv_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn reader_rejects_truncated_body() {
        let wire = encode_frame(b"complete").unwrap();
        let mut reader = Http2Reader {
            body: Body::from(wire.slice(..wire.len() - 2)).into_data_stream(),
            decoder: FrameDecoder::new(64),
            eof: false,
        };
        assert!(matches!(
            reader.recv_frame().await,
            Err(CallError::Codec(CodecError::UnexpectedEof))
        ));
    }

    #[tokio::test]
    async fn sink_sends_head_then_data_then_trailers() {
        let (mut sink, head_rx, mut frames_rx) = sink();
        sink.set_header("x-handler", "words");
        sink.send_frame(Bytes::from_static(b"hi")).await.unwrap();
        sink.set_header("x-too-late", "yes");
        sink.finish(&tonic::Status::new(tonic::Code::Ok, "")).await;

        let head = head_rx.await.unwrap();
        assert_eq!(head.get("x-handler").unwrap(), "words");
        assert!(head.get("x-too-late").is_none());

        let data = frames_rx.recv().await.unwrap().into_data().unwrap();
        assert_eq!(data, encode_frame(b"hi").unwrap());
        let trailers = frames_rx.recv().await.unwrap().into_trailers().unwrap();
        assert_eq!(trailers.get("grpc-status").unwrap(), "0");
    }

    #[tokio::test]
    async fn sink_error_status_travels_in_trailers() {
        let (sink, head_rx, mut frames_rx) = sink();
        sink.finish(&tonic::Status::unimplemented("unknown service Nobody")).await;
        assert!(head_rx.await.is_ok());
        let trailers = frames_rx.recv().await.unwrap().into_trailers().unwrap();
        assert_eq!(trailers.get("grpc-status").unwrap(), "12");
        assert_eq!(trailers.get("grpc-message").unwrap(), "unknown service Nobody");
    }

    #[test]
    fn trailer_message_is_percent_encoded() {
        let message = "panic: café closed\n   at vine::handler 100%";
        let map = trailers(&tonic::Status::internal(message));
        assert_eq!(map.get("grpc-status").unwrap(), "13");

        let raw = map.get("grpc-message").unwrap().to_str().unwrap();
        assert!(raw.bytes().all(|b| (0x20..0x7f).contains(&b)), "got {raw}");
        assert!(raw.contains("caf%C3%A9"));
        assert!(raw.contains("%0A"));
        assert!(raw.ends_with("100%25"));
        let decoded = percent_encoding::percent_decode_str(raw).decode_utf8().unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn ok_status_has_no_message() {
        let map = trailers(&tonic::Status::new(tonic::Code::Ok, ""));
        assert_eq!(map.get("grpc-status").unwrap(), "0");
        assert!(map.get("grpc-message").is_none());
    }

    #[tokio::test]
    async fn connection_over_the_limit_waits_for_a_permit() {
        let inner = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = inner.local_addr().unwrap();
        let mut listener = LimitListener::new(inner, 1);

        let _first_client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let _second_client = tokio::net::TcpStream::connect(addr).await.unwrap();

        let (first, _) = listener.accept().await;
        let pending = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(pending.is_err(), "second connection admitted past the limit");

        drop(first);
        let admitted = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
        assert!(admitted.is_ok(), "permit released on close");
    }

    #[tokio::test]
    async fn oversized_replies_are_refused() {
        let (mut sink, _head, _frames) = sink();
        assert!(matches!(
            sink.send_frame(Bytes::from(vec![0u8; 32])).await,
            Err(CallError::Codec(CodecError::MessageTooLarge { size: 32, max: 16 }))
        ));
    }
}
