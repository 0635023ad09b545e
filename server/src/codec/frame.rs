//! Length-prefixed body framing shared by the gRPC codec and the HTTP/2
//! transport: `[1 byte flags][4 byte big-endian length][payload]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::CodecError;

/// Default upper bound for a single message, 32 MiB.
pub const DEFAULT_MAX_MSG_SIZE: usize = 32 * 1024 * 1024;

/// Size of the frame prefix.
pub const HEADER_LEN: usize = 5;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Compression flag as sent by the peer.
    pub compressed: bool,
    /// Frame body.
    pub payload: Bytes,
}

/// Prefixes `payload` with the uncompressed frame header.
///
/// # Errors
///
/// Returns [`CodecError::MessageTooLarge`] if the payload does not fit the
/// 32-bit length field.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, CodecError> {
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::MessageTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(0);
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

fn check_len(len: usize, max: usize) -> Result<(), CodecError> {
    if len > max {
        return Err(CodecError::MessageTooLarge { size: len, max });
    }
    Ok(())
}

/// Incremental decoder fed with arbitrary chunks from the transport.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_size: usize,
}

impl FrameDecoder {
    /// Creates a decoder enforcing `max_size` per frame.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_size,
        }
    }

    /// Appends received bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Returns `true` if bytes are buffered that do not yet form a frame.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Pops the next complete frame.
    ///
    /// The length is validated against the limit as soon as the prefix is
    /// available, so an oversized frame is rejected before its body is
    /// buffered.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MessageTooLarge`] for oversized frames.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let compressed = self.buf[0] != 0;
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        check_len(len, self.max_size)?;
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(Frame {
            compressed,
            payload,
        }))
    }
}

/// Reads one frame from a byte stream. `Ok(None)` means clean end of stream.
///
/// # Errors
///
/// Returns [`CodecError::UnexpectedEof`] on a truncated frame and
/// [`CodecError::MessageTooLarge`] before allocating an oversized body.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Frame>, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(CodecError::UnexpectedEof);
        }
        filled += n;
    }
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    check_len(len, max_size)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CodecError::UnexpectedEof
        } else {
            CodecError::Io(e)
        }
    })?;
    Ok(Some(Frame {
        compressed: header[0] != 0,
        payload: Bytes::from(payload),
    }))
}

/// Writes one uncompressed frame.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    Ok(())
}
