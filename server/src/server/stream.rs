//! Bidirectional message streams handed to streaming methods and routers.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::codec::{Marshaler, Payload};
use crate::context::Context;
use crate::error::CallError;

/// Receiving half of a call: yields one message frame at a time.
#[async_trait]
pub trait FrameReader: Send {
    /// Next message, `None` once the peer finished sending.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed or truncated frames.
    async fn recv_frame(&mut self) -> Result<Option<Bytes>, CallError>;
}

/// Sending half of a call.
#[async_trait]
pub trait FrameWriter: Send {
    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns an error once the peer went away.
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), CallError>;

    /// Adds a response header. Ignored after the first message was sent.
    fn set_header(&mut self, key: &str, value: &str);
}

/// Static description of the call a stream belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallInfo {
    /// Service name.
    pub service: String,
    /// Method name.
    pub method: String,
    /// Negotiated content type.
    pub content_type: String,
}

impl CallInfo {
    /// `Service.Method`.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }
}

/// A typed view over a call's frames using the negotiated marshaler.
pub struct Stream {
    info: CallInfo,
    ctx: Context,
    marshaler: Arc<dyn Marshaler>,
    reader: Box<dyn FrameReader>,
    writer: Box<dyn FrameWriter>,
}

impl Stream {
    /// Assembles a stream from its halves.
    #[must_use]
    pub fn new(
        info: CallInfo,
        ctx: Context,
        marshaler: Arc<dyn Marshaler>,
        reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
    ) -> Self {
        Self {
            info,
            ctx,
            marshaler,
            reader,
            writer,
        }
    }

    /// Call description.
    #[must_use]
    pub fn info(&self) -> &CallInfo {
        &self.info
    }

    /// Call context.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Marshaler selected for this call.
    #[must_use]
    pub fn marshaler(&self) -> &Arc<dyn Marshaler> {
        &self.marshaler
    }

    /// Receives and decodes the next message.
    ///
    /// # Errors
    ///
    /// Returns transport or decoding errors.
    pub async fn recv<T: Payload + Default>(&mut self) -> Result<Option<T>, CallError> {
        let mut value = T::default();
        Ok(self.recv_into(&mut value).await?.then_some(value))
    }

    /// Decodes the next message into `value`; `false` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns transport or decoding errors.
    pub async fn recv_into(&mut self, value: &mut dyn Payload) -> Result<bool, CallError> {
        match self.reader.recv_frame().await? {
            Some(frame) => {
                self.marshaler.unmarshal(&frame, value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Encodes and sends a message.
    ///
    /// # Errors
    ///
    /// Returns transport or encoding errors.
    pub async fn send(&mut self, value: &dyn Payload) -> Result<(), CallError> {
        let data = self.marshaler.marshal(value)?;
        self.writer.send_frame(Bytes::from(data)).await
    }

    /// Receives a raw frame.
    ///
    /// # Errors
    ///
    /// Returns transport errors.
    pub async fn recv_raw(&mut self) -> Result<Option<Bytes>, CallError> {
        self.reader.recv_frame().await
    }

    /// Sends a raw frame.
    ///
    /// # Errors
    ///
    /// Returns transport errors.
    pub async fn send_raw(&mut self, frame: Bytes) -> Result<(), CallError> {
        self.writer.send_frame(frame).await
    }

    /// Adds a response header.
    pub fn set_header(&mut self, key: &str, value: &str) {
        self.writer.set_header(key, value);
    }

    /// Splits into the request and response halves.
    #[must_use]
    pub fn into_parts(
        self,
    ) -> (Context, CallInfo, Arc<dyn Marshaler>, Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        (self.ctx, self.info, self.marshaler, self.reader, self.writer)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("info", &self.info)
            .field("marshaler", &self.marshaler.name())
            .finish_non_exhaustive()
    }
}

/// In-memory reader over a fixed list of frames.
#[derive(Debug, Default)]
pub struct MemoryReader {
    frames: VecDeque<Bytes>,
}

impl MemoryReader {
    /// Reader yielding `frames` in order.
    #[must_use]
    pub fn new(frames: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv_frame(&mut self) -> Result<Option<Bytes>, CallError> {
        Ok(self.frames.pop_front())
    }
}

/// What a [`MemoryWriter`] captured.
#[derive(Debug, Default, Clone)]
pub struct Captured {
    /// Frames in send order.
    pub frames: Vec<Bytes>,
    /// Response headers.
    pub headers: Vec<(String, String)>,
}

/// In-memory writer recording frames into a shared buffer.
#[derive(Debug, Default, Clone)]
pub struct MemoryWriter {
    captured: Arc<parking_lot::Mutex<Captured>>,
}

impl MemoryWriter {
    /// New writer with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything sent so far.
    #[must_use]
    pub fn captured(&self) -> Captured {
        self.captured.lock().clone()
    }
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), CallError> {
        self.captured.lock().frames.push(frame);
        Ok(())
    }

    fn set_header(&mut self, key: &str, value: &str) {
        let mut captured = self.captured.lock();
        if captured.frames.is_empty() {
            captured.headers.push((key.to_string(), value.to_string()));
        }
    }
}
