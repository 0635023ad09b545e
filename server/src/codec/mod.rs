//! Codec abstraction layer.
//!
//! A [`Codec`] reads and writes whole [`Message`]s (header plus body) over a
//! byte stream, while a [`Marshaler`] converts a single body to and from bytes
//! for header-less paths such as broker payloads or individual gRPC frames.
//! Bodies travel type-erased as [`Payload`] trait objects.

pub mod body;
pub mod buffer;
pub mod bytes;
pub mod frame;
pub mod grpc;
pub mod json;
pub mod jsonrpc;
pub mod proto;
pub mod protorpc;
pub mod yaml;

pub use buffer::Buffer;
pub use frame::{DEFAULT_MAX_MSG_SIZE, Frame, FrameDecoder};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// Errors raised while encoding or decoding messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The destination or source value has a type the codec cannot handle.
    #[error("invalid message")]
    InvalidMessage,
    /// No codec is registered for the content type.
    #[error("unsupported Content-Type: {0}")]
    UnsupportedContentType(String),
    /// A frame announced a length above the configured maximum.
    #[error("received message larger than max ({size} vs. {max})")]
    MessageTooLarge {
        /// Announced frame length.
        size: usize,
        /// Configured limit.
        max: usize,
    },
    /// The frame carried the compression flag.
    #[error("compressed frames are not supported")]
    Compressed,
    /// The request path could not be split into service and method.
    #[error("unknown request path: {0}")]
    InvalidPath(String),
    /// The peer closed the stream before a complete message arrived.
    #[error("unexpected end of stream")]
    UnexpectedEof,
    /// Protobuf decoding failed.
    #[error("proto decode: {0}")]
    Proto(#[from] prost::DecodeError),
    /// JSON encoding or decoding failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// YAML encoding or decoding failed.
    #[error("yaml: {0}")]
    Yaml(String),
    /// Underlying I/O failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// The kind of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    /// A call from a client.
    #[default]
    Request,
    /// A successful reply.
    Response,
    /// An asynchronous broker event.
    Event,
    /// A failed reply.
    Error,
}

/// A protocol message as seen by codecs.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Sequence or correlation id.
    pub id: String,
    /// Kind of message.
    pub kind: MessageType,
    /// Target service (package prefix for gRPC paths).
    pub target: String,
    /// Method name as sent by the peer.
    pub method: String,
    /// `Service.Method` endpoint.
    pub endpoint: String,
    /// Error text carried by responses.
    pub error: String,
    /// Transport headers.
    pub header: HashMap<String, String>,
    /// Raw body, when the codec exposes it.
    pub body: ::bytes::Bytes,
}

impl Message {
    /// Looks up a header, first by exact key then ignoring ASCII case.
    #[must_use]
    pub fn header_value(&self, key: &str) -> Option<&str> {
        header_value(&self.header, key)
    }
}

pub(crate) fn header_value<'a>(header: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    header.get(key).map(String::as_str).or_else(|| {
        header
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    })
}

/// Serialization format a [`Payload`] can be encoded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Protocol buffers binary encoding.
    Proto,
    /// JSON text.
    Json,
    /// YAML text.
    Yaml,
    /// Raw bytes, only valid for byte container types.
    Bytes,
}

/// A type-erased message body.
///
/// Implemented for every type that is both a protobuf message and a serde
/// data type, which covers `prost` generated types that also derive serde.
pub trait Payload: Any + Send + Sync {
    /// Encodes the value in the requested format.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidMessage`] for [`Format::Bytes`] on
    /// non-byte types, or the underlying serializer error.
    fn encode_to(&self, format: Format) -> Result<Vec<u8>, CodecError>;

    /// Replaces the value with one decoded from `data`.
    ///
    /// # Errors
    ///
    /// Returns the underlying deserializer error.
    fn decode_from(&mut self, format: Format, data: &[u8]) -> Result<(), CodecError>;

    /// Name of the concrete type, used for registry endpoint metadata.
    fn type_name(&self) -> &'static str;

    /// Upcast used for downcasting erased replies.
    fn as_any(&self) -> &dyn Any;

    /// Owned upcast used for downcasting erased replies.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T> Payload for T
where
    T: prost::Message + Serialize + DeserializeOwned + Default + 'static,
{
    fn encode_to(&self, format: Format) -> Result<Vec<u8>, CodecError> {
        match format {
            Format::Proto => Ok(self.encode_to_vec()),
            Format::Json => Ok(serde_json::to_vec(self)?),
            Format::Yaml => serde_saphyr::to_string(self)
                .map(String::into_bytes)
                .map_err(|e| CodecError::Yaml(e.to_string())),
            Format::Bytes => {
                let any: &dyn Any = self;
                if let Some(frame) = any.downcast_ref::<RawFrame>() {
                    Ok(frame.data.clone())
                } else if let Some(data) = any.downcast_ref::<Vec<u8>>() {
                    Ok(data.clone())
                } else {
                    Err(CodecError::InvalidMessage)
                }
            }
        }
    }

    fn decode_from(&mut self, format: Format, data: &[u8]) -> Result<(), CodecError> {
        match format {
            Format::Proto => *self = T::decode(data)?,
            Format::Json => *self = serde_json::from_slice(data)?,
            Format::Yaml => {
                let text = std::str::from_utf8(data).map_err(|e| CodecError::Yaml(e.to_string()))?;
                *self = serde_saphyr::from_str(text).map_err(|e| CodecError::Yaml(e.to_string()))?;
            }
            Format::Bytes => {
                let any: &mut dyn Any = self;
                if let Some(frame) = any.downcast_mut::<RawFrame>() {
                    frame.data = data.to_vec();
                } else if let Some(buf) = any.downcast_mut::<Vec<u8>>() {
                    *buf = data.to_vec();
                } else {
                    return Err(CodecError::InvalidMessage);
                }
            }
        }
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        short_type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Last path segment of a type name, e.g. `StringReq` for `demo::StringReq`.
#[must_use]
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Byte container accepted by the bytes codec.
#[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
pub struct RawFrame {
    /// Frame contents.
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

impl RawFrame {
    /// Wraps raw bytes.
    #[must_use]
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

/// A bidirectional byte stream a codec can own.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

/// Reads and writes whole messages over a connection.
#[async_trait]
pub trait Codec: Send {
    /// Reads the next message header into `msg`.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is malformed or the stream fails.
    async fn read_header(&mut self, msg: &mut Message, kind: MessageType) -> Result<(), CodecError>;

    /// Reads the body belonging to the last header. `None` discards it.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be read or decoded.
    async fn read_body(&mut self, body: Option<&mut dyn Payload>) -> Result<(), CodecError>;

    /// Writes a message header and optional body.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    async fn write(&mut self, msg: &Message, body: Option<&dyn Payload>) -> Result<(), CodecError>;

    /// Flushes and shuts the connection down.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    async fn close(&mut self) -> Result<(), CodecError>;

    /// Codec name, e.g. `grpc` or `json-rpc`.
    fn name(&self) -> &'static str;
}

/// Builds a codec over a connection.
pub type NewCodec = fn(Box<dyn Conn>) -> Box<dyn Codec>;

/// Converts single bodies to and from bytes.
pub trait Marshaler: Send + Sync {
    /// Encodes a body.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented in this format.
    fn marshal(&self, value: &dyn Payload) -> Result<Vec<u8>, CodecError>;

    /// Decodes `data` into `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not a valid encoding of the value's type.
    fn unmarshal(&self, data: &[u8], value: &mut dyn Payload) -> Result<(), CodecError>;

    /// Marshaler name.
    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn Marshaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Marshaler({})", self.name())
    }
}
