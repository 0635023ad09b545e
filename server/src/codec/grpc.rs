//! gRPC compatible framed codec.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;

use super::frame::{DEFAULT_MAX_MSG_SIZE, read_frame, write_frame};
use super::{Codec, CodecError, Conn, Format, Message, MessageType, Payload, header_value};

/// Sentinel error text marking a clean end of stream.
pub const END_OF_STREAM: &str = "EOS";

/// Header naming the target service when no `:path` is present.
pub const SERVICE_HEADER: &str = "Vine-Service";
/// Header naming the endpoint when no `:path` is present.
pub const ENDPOINT_HEADER: &str = "Vine-Endpoint";

const USER_AGENT: &str = concat!("vine-grpc/", env!("CARGO_PKG_VERSION"));

/// Framed codec speaking the gRPC body framing with a protobuf or JSON inner
/// encoding.
pub struct GrpcCodec {
    conn: Box<dyn Conn>,
    format: Format,
    content_type: &'static str,
    max_msg_size: usize,
    inbound: HashMap<String, String>,
    outbound: HashMap<String, String>,
}

impl GrpcCodec {
    /// Creates a codec with protobuf bodies.
    #[must_use]
    pub fn new(conn: Box<dyn Conn>) -> Self {
        Self {
            conn,
            format: Format::Proto,
            content_type: "application/grpc+proto",
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            inbound: HashMap::new(),
            outbound: HashMap::new(),
        }
    }

    /// Creates a codec with JSON bodies.
    #[must_use]
    pub fn json(conn: Box<dyn Conn>) -> Self {
        Self {
            format: Format::Json,
            content_type: "application/grpc+json",
            ..Self::new(conn)
        }
    }

    /// Supplies the transport headers `read_header` derives routing from.
    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.inbound = headers;
        self
    }

    /// Overrides the per-message size limit.
    #[must_use]
    pub fn with_max_msg_size(mut self, max: usize) -> Self {
        self.max_msg_size = max;
        self
    }

    /// Headers synthesized by the last `write`, for the transport to emit.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.outbound
    }
}

/// Splits `/a.pkg.Service/Method` into (`a.pkg`, `Service.Method`).
///
/// # Errors
///
/// Returns [`CodecError::InvalidPath`] when the path does not have exactly
/// two non-empty segments.
pub fn split_path(path: &str) -> Result<(String, String), CodecError> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() != 3 || parts[1].is_empty() || parts[2].is_empty() {
        return Err(CodecError::InvalidPath(path.to_string()));
    }
    let (target, service) = match parts[1].rsplit_once('.') {
        Some((pkg, svc)) => (pkg.to_string(), svc),
        None => (String::new(), parts[1]),
    };
    Ok((target, format!("{service}.{}", parts[2])))
}

fn build_path(target: &str, endpoint: &str) -> String {
    let (service, method) = endpoint.split_once('.').unwrap_or((endpoint, ""));
    if target.is_empty() {
        format!("/{service}/{method}")
    } else {
        format!("/{target}.{service}/{method}")
    }
}

/// [`NewCodec`](super::NewCodec) for `application/grpc` and
/// `application/grpc+proto`.
pub fn new_codec(conn: Box<dyn Conn>) -> Box<dyn Codec> {
    Box::new(GrpcCodec::new(conn))
}

/// [`NewCodec`](super::NewCodec) for `application/grpc+json`.
pub fn new_json_codec(conn: Box<dyn Conn>) -> Box<dyn Codec> {
    Box::new(GrpcCodec::json(conn))
}

#[async_trait]
impl Codec for GrpcCodec {
    async fn read_header(
        &mut self,
        msg: &mut Message,
        kind: MessageType,
    ) -> Result<(), CodecError> {
        msg.kind = kind;
        for (k, v) in &self.inbound {
            msg.header.entry(k.clone()).or_insert_with(|| v.clone());
        }
        let path = msg.header_value(":path").unwrap_or_default().to_string();
        if path.starts_with('/') {
            let (target, endpoint) = split_path(&path)?;
            msg.target = target;
            msg.endpoint = endpoint;
        } else {
            msg.target = msg.header_value(SERVICE_HEADER).unwrap_or_default().to_string();
            msg.endpoint = msg.header_value(ENDPOINT_HEADER).unwrap_or_default().to_string();
        }
        msg.method = msg.endpoint.clone();
        if let Some(id) = header_value(&msg.header, "Vine-Id") {
            msg.id = id.to_string();
        }
        Ok(())
    }

    async fn read_body(&mut self, body: Option<&mut dyn Payload>) -> Result<(), CodecError> {
        let frame = read_frame(&mut self.conn, self.max_msg_size)
            .await?
            .ok_or(CodecError::UnexpectedEof)?;
        if frame.compressed {
            return Err(CodecError::Compressed);
        }
        if let Some(body) = body {
            body.decode_from(self.format, &frame.payload)?;
        }
        Ok(())
    }

    async fn write(&mut self, msg: &Message, body: Option<&dyn Payload>) -> Result<(), CodecError> {
        self.outbound.clear();
        match msg.kind {
            MessageType::Request | MessageType::Event => {
                self.outbound.insert(":method".into(), "POST".into());
                self.outbound.insert(":path".into(), build_path(&msg.target, &msg.endpoint));
                self.outbound.insert(":authority".into(), msg.target.clone());
                self.outbound.insert("user-agent".into(), USER_AGENT.into());
                self.outbound.insert("content-type".into(), self.content_type.into());
                self.outbound.insert("te".into(), "trailers".into());
            }
            MessageType::Response => {
                self.outbound.insert("content-type".into(), self.content_type.into());
                self.outbound.insert("trailer".into(), "grpc-status, grpc-message".into());
                self.outbound.insert("grpc-status".into(), "0".into());
            }
            MessageType::Error => {
                self.outbound.insert("content-type".into(), self.content_type.into());
                self.outbound.insert("trailer".into(), "grpc-status, grpc-message".into());
                if msg.error == END_OF_STREAM {
                    self.outbound.insert("grpc-status".into(), "0".into());
                } else {
                    self.outbound.insert("grpc-status".into(), "2".into());
                    self.outbound.insert("grpc-message".into(), msg.error.clone());
                }
                return Ok(());
            }
        }
        if let Some(body) = body {
            let data = body.encode_to(self.format)?;
            if data.len() > self.max_msg_size {
                return Err(CodecError::MessageTooLarge {
                    size: data.len(),
                    max: self.max_msg_size,
                });
            }
            write_frame(&mut self.conn, &data).await?;
            self.conn.flush().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CodecError> {
        self.conn.shutdown().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "grpc"
    }
}
