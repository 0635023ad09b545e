//! Header-less codec shared by the json, proto, yaml and bytes content types.
//!
//! The whole remaining stream is one body; headers travel out of band (broker
//! message headers, transport metadata).

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{Codec, CodecError, Conn, Format, Message, MessageType, Payload};

/// Codec that reads the rest of the stream as a single body.
pub struct BodyCodec {
    conn: Box<dyn Conn>,
    format: Format,
    name: &'static str,
}

impl BodyCodec {
    /// Creates a codec decoding bodies in `format`.
    #[must_use]
    pub fn new(conn: Box<dyn Conn>, format: Format, name: &'static str) -> Self {
        Self { conn, format, name }
    }
}

#[async_trait]
impl Codec for BodyCodec {
    async fn read_header(
        &mut self,
        msg: &mut Message,
        kind: MessageType,
    ) -> Result<(), CodecError> {
        msg.kind = kind;
        Ok(())
    }

    async fn read_body(&mut self, body: Option<&mut dyn Payload>) -> Result<(), CodecError> {
        let mut data = Vec::new();
        self.conn.read_to_end(&mut data).await?;
        match body {
            Some(body) => body.decode_from(self.format, &data),
            None => Ok(()),
        }
    }

    async fn write(
        &mut self,
        _msg: &Message,
        body: Option<&dyn Payload>,
    ) -> Result<(), CodecError> {
        if let Some(body) = body {
            let data = body.encode_to(self.format)?;
            self.conn.write_all(&data).await?;
            self.conn.flush().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CodecError> {
        self.conn.shutdown().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
