//! YAML body codec and marshaler for `application/yaml`.

use super::body::BodyCodec;
use super::{Codec, CodecError, Conn, Format, Marshaler, Payload};

/// [`NewCodec`](super::NewCodec) for YAML bodies.
pub fn new_codec(conn: Box<dyn Conn>) -> Box<dyn Codec> {
    Box::new(BodyCodec::new(conn, Format::Yaml, "yaml"))
}

/// YAML marshaler.
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlMarshaler;

impl Marshaler for YamlMarshaler {
    fn marshal(&self, value: &dyn Payload) -> Result<Vec<u8>, CodecError> {
        value.encode_to(Format::Yaml)
    }

    fn unmarshal(&self, data: &[u8], value: &mut dyn Payload) -> Result<(), CodecError> {
        value.decode_from(Format::Yaml, data)
    }

    fn name(&self) -> &'static str {
        "yaml"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
    struct Setting {
        #[prost(string, tag = "1")]
        key: String,
    }

    #[test]
    fn decodes_block_mapping() {
        let mut setting = Setting::default();
        YamlMarshaler.unmarshal(b"key: retries\n", &mut setting).unwrap();
        assert_eq!(setting.key, "retries");
    }
}
