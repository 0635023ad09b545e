//! Generic call routing, used instead of the method table when configured.
//!
//! A [`Router`] sees every call as a codec-backed request/response pair,
//! whether the call is unary or streaming. Gateways and proxies plug in here.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::codec::{Marshaler, Payload};
use crate::context::Context;
use crate::error::CallError;
use crate::metadata::Metadata;

use super::stream::{CallInfo, FrameReader, FrameWriter, Stream};

/// Inbound half of a routed call.
pub struct RpcRequest {
    info: CallInfo,
    header: Metadata,
    stream: bool,
    marshaler: Arc<dyn Marshaler>,
    reader: Box<dyn FrameReader>,
}

impl RpcRequest {
    /// Service name.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.info.service
    }

    /// Method name.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.info.method
    }

    /// `Service.Method`.
    #[must_use]
    pub fn endpoint(&self) -> String {
        self.info.endpoint()
    }

    /// Negotiated content type.
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.info.content_type
    }

    /// Request metadata.
    #[must_use]
    pub fn header(&self) -> &Metadata {
        &self.header
    }

    /// True when the method is declared as streaming locally.
    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.stream
    }

    /// Marshaler selected for the call.
    #[must_use]
    pub fn marshaler(&self) -> &Arc<dyn Marshaler> {
        &self.marshaler
    }

    /// Reads and decodes the next message; `false` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns transport or decoding errors.
    pub async fn read(&mut self, value: &mut dyn Payload) -> Result<bool, CallError> {
        match self.reader.recv_frame().await? {
            Some(frame) => {
                self.marshaler.unmarshal(&frame, value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reads the next raw message.
    ///
    /// # Errors
    ///
    /// Returns transport errors.
    pub async fn read_raw(&mut self) -> Result<Option<Bytes>, CallError> {
        self.reader.recv_frame().await
    }
}

/// Outbound half of a routed call.
pub struct RpcResponse {
    marshaler: Arc<dyn Marshaler>,
    writer: Box<dyn FrameWriter>,
}

impl RpcResponse {
    /// Sets a response header before the first write.
    pub fn write_header(&mut self, key: &str, value: &str) {
        self.writer.set_header(key, value);
    }

    /// Encodes and writes one message.
    ///
    /// # Errors
    ///
    /// Returns transport or encoding errors.
    pub async fn write(&mut self, value: &dyn Payload) -> Result<(), CallError> {
        let data = self.marshaler.marshal(value)?;
        self.writer.send_frame(Bytes::from(data)).await
    }

    /// Writes one raw message.
    ///
    /// # Errors
    ///
    /// Returns transport errors.
    pub async fn write_raw(&mut self, frame: Bytes) -> Result<(), CallError> {
        self.writer.send_frame(frame).await
    }
}

/// Builds the request/response pair for a routed call.
pub(crate) fn split(stream: Stream, is_stream: bool) -> (Context, RpcRequest, RpcResponse) {
    let (ctx, info, marshaler, reader, writer) = stream.into_parts();
    let request = RpcRequest {
        info,
        header: ctx.metadata().clone(),
        stream: is_stream,
        marshaler: Arc::clone(&marshaler),
        reader,
    };
    (ctx, request, RpcResponse { marshaler, writer })
}

/// Handles every call when installed on the server.
#[async_trait]
pub trait Router: Send + Sync {
    /// Serves one call.
    ///
    /// # Errors
    ///
    /// The returned error becomes the call's status.
    async fn serve_request(
        &self,
        ctx: Context,
        req: RpcRequest,
        rsp: RpcResponse,
    ) -> Result<(), CallError>;
}
