//! Line-delimited JSON-RPC 1.0 codecs.
//!
//! Responses on the wire carry only the request id, so the client side keeps a
//! pending `id -> method` table to restore `Message::method` on read.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use super::frame::DEFAULT_MAX_MSG_SIZE;
use super::{Codec, CodecError, Conn, Format, Message, MessageType, Payload};

#[derive(Debug, Serialize, Deserialize)]
struct WireRequest {
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

/// Reads one line of at most `max` bytes, newline included.
async fn read_line(conn: &mut BufReader<Box<dyn Conn>>, max: usize) -> Result<String, CodecError> {
    let mut line = String::new();
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
    let n = (&mut *conn).take(limit).read_line(&mut line).await?;
    if n == 0 {
        return Err(CodecError::UnexpectedEof);
    }
    if n > max {
        return Err(CodecError::MessageTooLarge { size: n, max });
    }
    Ok(line)
}

async fn write_line<T: Serialize>(
    conn: &mut BufReader<Box<dyn Conn>>,
    value: &T,
) -> Result<(), CodecError> {
    let mut data = serde_json::to_vec(value)?;
    data.push(b'\n');
    conn.write_all(&data).await?;
    conn.flush().await?;
    Ok(())
}

fn body_value(body: Option<&dyn Payload>) -> Result<Value, CodecError> {
    match body {
        Some(body) => Ok(serde_json::from_slice(&body.encode_to(Format::Json)?)?),
        None => Ok(Value::Null),
    }
}

fn decode_value(value: &Value, body: Option<&mut dyn Payload>) -> Result<(), CodecError> {
    match body {
        Some(body) => body.decode_from(Format::Json, &serde_json::to_vec(value)?),
        None => Ok(()),
    }
}

fn error_text(error: &Value) -> String {
    match error {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Client half: writes requests, reads responses.
pub struct ClientCodec {
    conn: BufReader<Box<dyn Conn>>,
    pending: HashMap<u64, String>,
    result: Value,
    max_line: usize,
}

impl ClientCodec {
    /// Wraps a connection.
    #[must_use]
    pub fn new(conn: Box<dyn Conn>) -> Self {
        Self {
            conn: BufReader::new(conn),
            pending: HashMap::new(),
            result: Value::Null,
            max_line: DEFAULT_MAX_MSG_SIZE,
        }
    }

    /// Rejects lines longer than `max` bytes instead of the default 32 MiB.
    #[must_use]
    pub fn with_max_line(mut self, max: usize) -> Self {
        self.max_line = max;
        self
    }

    /// Number of requests still waiting for a response.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// [`NewCodec`](super::NewCodec) for the client side.
pub fn new_client_codec(conn: Box<dyn Conn>) -> Box<dyn Codec> {
    Box::new(ClientCodec::new(conn))
}

#[async_trait]
impl Codec for ClientCodec {
    async fn read_header(
        &mut self,
        msg: &mut Message,
        kind: MessageType,
    ) -> Result<(), CodecError> {
        let line = read_line(&mut self.conn, self.max_line).await?;
        let response: WireResponse = serde_json::from_str(&line)?;
        let id = response.id.as_u64().ok_or(CodecError::InvalidMessage)?;
        msg.kind = kind;
        msg.id = id.to_string();
        msg.method = self.pending.remove(&id).unwrap_or_default();
        msg.endpoint = msg.method.clone();
        msg.error = error_text(&response.error);
        if !msg.error.is_empty() {
            msg.kind = MessageType::Error;
        }
        self.result = response.result;
        Ok(())
    }

    async fn read_body(&mut self, body: Option<&mut dyn Payload>) -> Result<(), CodecError> {
        let result = std::mem::take(&mut self.result);
        decode_value(&result, body)
    }

    async fn write(&mut self, msg: &Message, body: Option<&dyn Payload>) -> Result<(), CodecError> {
        let id: u64 = msg.id.parse().map_err(|_| CodecError::InvalidMessage)?;
        let method = if msg.endpoint.is_empty() {
            msg.method.clone()
        } else {
            msg.endpoint.clone()
        };
        self.pending.insert(id, method.clone());
        let request = WireRequest {
            method,
            params: Value::Array(vec![body_value(body)?]),
            id: Value::from(id),
        };
        write_line(&mut self.conn, &request).await
    }

    async fn close(&mut self) -> Result<(), CodecError> {
        self.conn.shutdown().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "json-rpc"
    }
}

/// Server half: reads requests, writes responses.
pub struct ServerCodec {
    conn: BufReader<Box<dyn Conn>>,
    seq: u64,
    pending: HashMap<u64, Value>,
    params: Value,
    max_line: usize,
}

impl ServerCodec {
    /// Wraps a connection.
    #[must_use]
    pub fn new(conn: Box<dyn Conn>) -> Self {
        Self {
            conn: BufReader::new(conn),
            seq: 0,
            pending: HashMap::new(),
            params: Value::Null,
            max_line: DEFAULT_MAX_MSG_SIZE,
        }
    }

    /// Rejects lines longer than `max` bytes instead of the default 32 MiB.
    #[must_use]
    pub fn with_max_line(mut self, max: usize) -> Self {
        self.max_line = max;
        self
    }
}

/// [`NewCodec`](super::NewCodec) for the server side.
pub fn new_server_codec(conn: Box<dyn Conn>) -> Box<dyn Codec> {
    Box::new(ServerCodec::new(conn))
}

#[async_trait]
impl Codec for ServerCodec {
    async fn read_header(
        &mut self,
        msg: &mut Message,
        kind: MessageType,
    ) -> Result<(), CodecError> {
        let line = read_line(&mut self.conn, self.max_line).await?;
        let request: WireRequest = serde_json::from_str(&line)?;
        self.seq += 1;
        self.pending.insert(self.seq, request.id);
        msg.kind = kind;
        msg.id = self.seq.to_string();
        msg.method = request.method.clone();
        msg.endpoint = request.method;
        self.params = match request.params {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            other => other,
        };
        Ok(())
    }

    async fn read_body(&mut self, body: Option<&mut dyn Payload>) -> Result<(), CodecError> {
        let params = std::mem::take(&mut self.params);
        decode_value(&params, body)
    }

    async fn write(&mut self, msg: &Message, body: Option<&dyn Payload>) -> Result<(), CodecError> {
        let seq: u64 = msg.id.parse().map_err(|_| CodecError::InvalidMessage)?;
        let id = self.pending.remove(&seq).unwrap_or(Value::Null);
        let response = if msg.error.is_empty() {
            WireResponse {
                id,
                result: body_value(body)?,
                error: Value::Null,
            }
        } else {
            WireResponse {
                id,
                result: Value::Null,
                error: Value::String(msg.error.clone()),
            }
        };
        write_line(&mut self.conn, &response).await
    }

    async fn close(&mut self) -> Result<(), CodecError> {
        self.conn.shutdown().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "json-rpc"
    }
}
