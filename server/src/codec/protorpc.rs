//! Netstring-framed proto-RPC codec for raw socket transports.
//!
//! Every message is two frames on the wire, a protobuf header followed by the
//! protobuf body, each prefixed with a 4 byte big-endian length.

use async_trait::async_trait;
use prost::Message as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::frame::DEFAULT_MAX_MSG_SIZE;
use super::{Codec, CodecError, Conn, Format, Message, MessageType, Payload};

#[derive(Clone, PartialEq, prost::Message)]
struct RequestHeader {
    #[prost(string, tag = "1")]
    method: String,
    #[prost(uint64, tag = "2")]
    seq: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
struct ResponseHeader {
    #[prost(string, tag = "1")]
    method: String,
    #[prost(uint64, tag = "2")]
    seq: u64,
    #[prost(string, tag = "3")]
    error: String,
}

/// Proto-RPC codec usable on either side of a connection.
pub struct ProtoRpcCodec {
    conn: Box<dyn Conn>,
    max_msg_size: usize,
}

impl ProtoRpcCodec {
    /// Wraps a connection with the default size limit.
    #[must_use]
    pub fn new(conn: Box<dyn Conn>) -> Self {
        Self {
            conn,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
        }
    }

    async fn write_netstring(&mut self, data: &[u8]) -> Result<(), CodecError> {
        let len = u32::try_from(data.len()).map_err(|_| CodecError::MessageTooLarge {
            size: data.len(),
            max: self.max_msg_size,
        })?;
        self.conn.write_all(&len.to_be_bytes()).await?;
        self.conn.write_all(data).await?;
        Ok(())
    }

    async fn read_netstring(&mut self) -> Result<Vec<u8>, CodecError> {
        let mut prefix = [0u8; 4];
        self.conn.read_exact(&mut prefix).await.map_err(eof)?;
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_msg_size {
            return Err(CodecError::MessageTooLarge {
                size: len,
                max: self.max_msg_size,
            });
        }
        let mut data = vec![0u8; len];
        self.conn.read_exact(&mut data).await.map_err(eof)?;
        Ok(data)
    }
}

fn eof(e: std::io::Error) -> CodecError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CodecError::UnexpectedEof
    } else {
        CodecError::Io(e)
    }
}

fn seq_of(msg: &Message) -> u64 {
    msg.id.parse().unwrap_or_default()
}

/// [`NewCodec`](super::NewCodec) for `application/proto-rpc`.
pub fn new_codec(conn: Box<dyn Conn>) -> Box<dyn Codec> {
    Box::new(ProtoRpcCodec::new(conn))
}

#[async_trait]
impl Codec for ProtoRpcCodec {
    async fn read_header(
        &mut self,
        msg: &mut Message,
        kind: MessageType,
    ) -> Result<(), CodecError> {
        let data = self.read_netstring().await?;
        msg.kind = kind;
        match kind {
            MessageType::Request | MessageType::Event => {
                let header = RequestHeader::decode(data.as_slice())?;
                msg.id = header.seq.to_string();
                msg.method = header.method.clone();
                msg.endpoint = header.method;
            }
            MessageType::Response | MessageType::Error => {
                let header = ResponseHeader::decode(data.as_slice())?;
                msg.id = header.seq.to_string();
                msg.method = header.method.clone();
                msg.endpoint = header.method;
                if !header.error.is_empty() {
                    msg.kind = MessageType::Error;
                }
                msg.error = header.error;
            }
        }
        Ok(())
    }

    async fn read_body(&mut self, body: Option<&mut dyn Payload>) -> Result<(), CodecError> {
        let data = self.read_netstring().await?;
        match body {
            Some(body) => body.decode_from(Format::Proto, &data),
            None => Ok(()),
        }
    }

    async fn write(&mut self, msg: &Message, body: Option<&dyn Payload>) -> Result<(), CodecError> {
        let method = if msg.endpoint.is_empty() {
            msg.method.clone()
        } else {
            msg.endpoint.clone()
        };
        let header = match msg.kind {
            MessageType::Request | MessageType::Event => RequestHeader {
                method,
                seq: seq_of(msg),
            }
            .encode_to_vec(),
            MessageType::Response | MessageType::Error => ResponseHeader {
                method,
                seq: seq_of(msg),
                error: msg.error.clone(),
            }
            .encode_to_vec(),
        };
        self.write_netstring(&header).await?;
        let data = match body {
            Some(body) if msg.error.is_empty() => body.encode_to(Format::Proto)?,
            _ => Vec::new(),
        };
        self.write_netstring(&data).await?;
        self.conn.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CodecError> {
        self.conn.shutdown().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "proto-rpc"
    }
}
