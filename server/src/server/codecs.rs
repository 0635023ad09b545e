//! Content-type table shared by the dispatcher and subscriber dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::{self, CodecError, Marshaler, NewCodec};

/// Content type assumed for gRPC calls without `x-content-type`.
pub const DEFAULT_CONTENT_TYPE: &str = "application/grpc";
/// Content type assumed for broker messages without `Content-Type`.
pub const DEFAULT_SUBSCRIBER_CONTENT_TYPE: &str = "application/protobuf";

/// A marshaler for single bodies and a codec factory for whole messages.
#[derive(Clone)]
pub struct CodecEntry {
    /// Body marshaler.
    pub marshaler: Arc<dyn Marshaler>,
    /// Message codec factory.
    pub new_codec: NewCodec,
}

impl std::fmt::Debug for CodecEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecEntry")
            .field("marshaler", &self.marshaler.name())
            .finish_non_exhaustive()
    }
}

/// Content type to codec mapping.
#[derive(Debug, Clone)]
pub struct Codecs {
    entries: HashMap<String, CodecEntry>,
}

fn entry(marshaler: Arc<dyn Marshaler>, new_codec: NewCodec) -> CodecEntry {
    CodecEntry { marshaler, new_codec }
}

impl Default for Codecs {
    fn default() -> Self {
        let json: Arc<dyn Marshaler> = Arc::new(codec::json::JsonMarshaler);
        let proto: Arc<dyn Marshaler> = Arc::new(codec::proto::ProtoMarshaler);
        let bytes: Arc<dyn Marshaler> = Arc::new(codec::bytes::BytesMarshaler);
        let yaml: Arc<dyn Marshaler> = Arc::new(codec::yaml::YamlMarshaler);

        let entries = [
            ("application/grpc", entry(Arc::clone(&proto), codec::grpc::new_codec)),
            ("application/grpc+proto", entry(Arc::clone(&proto), codec::grpc::new_codec)),
            ("application/grpc+json", entry(Arc::clone(&json), codec::grpc::new_json_codec)),
            ("application/json", entry(Arc::clone(&json), codec::json::new_codec)),
            ("application/proto", entry(Arc::clone(&proto), codec::proto::new_codec)),
            ("application/protobuf", entry(Arc::clone(&proto), codec::proto::new_codec)),
            ("application/octet-stream", entry(bytes, codec::bytes::new_codec)),
            ("application/json-rpc", entry(json, codec::jsonrpc::new_server_codec)),
            ("application/proto-rpc", entry(proto, codec::protorpc::new_codec)),
            ("application/yaml", entry(yaml, codec::yaml::new_codec)),
        ];
        Self {
            entries: entries
                .into_iter()
                .map(|(ct, e)| (ct.to_string(), e))
                .collect(),
        }
    }
}

/// Lowercases and drops parameters such as `; charset=utf-8`.
#[must_use]
pub fn normalize(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

impl Codecs {
    /// The built-in table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a content type.
    pub fn insert(&mut self, content_type: &str, entry: CodecEntry) {
        self.entries.insert(normalize(content_type), entry);
    }

    /// Looks up the entry for a content type.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedContentType`] for unknown types.
    pub fn get(&self, content_type: &str) -> Result<&CodecEntry, CodecError> {
        self.entries
            .get(&normalize(content_type))
            .ok_or_else(|| CodecError::UnsupportedContentType(content_type.to_string()))
    }

    /// Marshaler for a content type.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedContentType`] for unknown types.
    pub fn marshaler(&self, content_type: &str) -> Result<Arc<dyn Marshaler>, CodecError> {
        self.get(content_type).map(|e| Arc::clone(&e.marshaler))
    }

    /// Codec factory for a content type.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedContentType`] for unknown types.
    pub fn new_codec(&self, content_type: &str) -> Result<NewCodec, CodecError> {
        self.get(content_type).map(|e| e.new_codec)
    }

    /// Registered content types, sorted.
    #[must_use]
    pub fn content_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_covers_wire_types() {
        let codecs = Codecs::new();
        assert_eq!(codecs.marshaler("application/grpc").unwrap().name(), "proto");
        assert_eq!(codecs.marshaler("application/grpc+json").unwrap().name(), "json");
        assert_eq!(codecs.marshaler("Application/JSON; charset=utf-8").unwrap().name(), "json");
        assert_eq!(codecs.marshaler("application/octet-stream").unwrap().name(), "bytes");
        assert_eq!(codecs.content_types().len(), 10);
    }

    #[test]
    fn unknown_content_type_never_falls_back() {
        let err = Codecs::new().marshaler("text/html").unwrap_err();
        assert_eq!(err.to_string(), "unsupported Content-Type: text/html");
    }

    #[test]
    fn overrides_replace_entries() {
        let mut codecs = Codecs::new();
        codecs.insert(
            "application/grpc",
            CodecEntry {
                marshaler: Arc::new(codec::json::JsonMarshaler),
                new_codec: codec::grpc::new_json_codec,
            },
        );
        assert_eq!(codecs.marshaler("application/grpc").unwrap().name(), "json");
    }
}
