//! Protobuf body codec and marshaler for `application/proto` and
//! `application/protobuf`.

use super::body::BodyCodec;
use super::{Codec, CodecError, Conn, Format, Marshaler, Payload};

/// [`NewCodec`](super::NewCodec) for protobuf bodies.
pub fn new_codec(conn: Box<dyn Conn>) -> Box<dyn Codec> {
    Box::new(BodyCodec::new(conn, Format::Proto, "proto"))
}

/// Protobuf marshaler.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtoMarshaler;

impl Marshaler for ProtoMarshaler {
    fn marshal(&self, value: &dyn Payload) -> Result<Vec<u8>, CodecError> {
        value.encode_to(Format::Proto)
    }

    fn unmarshal(&self, data: &[u8], value: &mut dyn Payload) -> Result<(), CodecError> {
        value.decode_from(Format::Proto, data)
    }

    fn name(&self) -> &'static str {
        "proto"
    }
}
