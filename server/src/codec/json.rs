//! JSON body codec and marshaler for `application/json`.

use super::body::BodyCodec;
use super::{Codec, CodecError, Conn, Format, Marshaler, Payload};

/// [`NewCodec`](super::NewCodec) for JSON bodies.
pub fn new_codec(conn: Box<dyn Conn>) -> Box<dyn Codec> {
    Box::new(BodyCodec::new(conn, Format::Json, "json"))
}

/// JSON marshaler.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMarshaler;

impl Marshaler for JsonMarshaler {
    fn marshal(&self, value: &dyn Payload) -> Result<Vec<u8>, CodecError> {
        value.encode_to(Format::Json)
    }

    fn unmarshal(&self, data: &[u8], value: &mut dyn Payload) -> Result<(), CodecError> {
        value.decode_from(Format::Json, data)
    }

    fn name(&self) -> &'static str {
        "json"
    }
}
