//! Raw bytes codec for `application/octet-stream`.
//!
//! Only [`RawFrame`](super::RawFrame) and `Vec<u8>` values can be read or
//! written; anything else fails with [`CodecError::InvalidMessage`].

use super::body::BodyCodec;
use super::{Codec, CodecError, Conn, Format, Marshaler, Payload};

/// [`NewCodec`](super::NewCodec) for raw bytes.
pub fn new_codec(conn: Box<dyn Conn>) -> Box<dyn Codec> {
    Box::new(BodyCodec::new(conn, Format::Bytes, "bytes"))
}

/// Marshaler passing bytes through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesMarshaler;

impl Marshaler for BytesMarshaler {
    fn marshal(&self, value: &dyn Payload) -> Result<Vec<u8>, CodecError> {
        value.encode_to(Format::Bytes)
    }

    fn unmarshal(&self, data: &[u8], value: &mut dyn Payload) -> Result<(), CodecError> {
        value.decode_from(Format::Bytes, data)
    }

    fn name(&self) -> &'static str {
        "bytes"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Buffer, Message, MessageType, RawFrame};

    #[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
    struct Typed {
        #[prost(int32, tag = "1")]
        n: i32,
    }

    #[tokio::test]
    async fn read_body_consumes_remaining_stream() {
        let mut codec = new_codec(Box::new(Buffer::new(b"every last byte".to_vec())));
        let mut msg = Message::default();
        codec.read_header(&mut msg, MessageType::Event).await.unwrap();
        let mut frame = RawFrame::default();
        codec.read_body(Some(&mut frame)).await.unwrap();
        assert_eq!(frame.data, b"every last byte");
    }

    #[tokio::test]
    async fn read_body_rejects_structured_destination() {
        let mut codec = new_codec(Box::new(Buffer::new(b"x".to_vec())));
        let mut typed = Typed::default();
        assert!(matches!(
            codec.read_body(Some(&mut typed)).await,
            Err(CodecError::InvalidMessage)
        ));
    }

    #[test]
    fn marshaler_accepts_vec() {
        let marshaler = BytesMarshaler;
        let mut out: Vec<u8> = Vec::new();
        marshaler.unmarshal(b"abc", &mut out).unwrap();
        assert_eq!(marshaler.marshal(&out).unwrap(), b"abc");
        assert!(marshaler.marshal(&Typed { n: 1 }).is_err());
    }
}
