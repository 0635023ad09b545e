//! Request scoped metadata built from transport headers.

use axum::http::HeaderMap;
use std::collections::HashMap;
use std::time::Duration;

/// Header carrying the call timeout as integer nanoseconds.
pub const TIMEOUT_HEADER: &str = "timeout";
/// Standard gRPC timeout header, e.g. `100m`.
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";
/// Transport content type.
pub const CONTENT_TYPE_HEADER: &str = "content-type";
/// Codec override that wins over `content-type`.
pub const X_CONTENT_TYPE_HEADER: &str = "x-content-type";

/// Headers consumed by the transport that handlers never see.
const TRANSPORT_HEADERS: &[&str] = &[
    TIMEOUT_HEADER,
    GRPC_TIMEOUT_HEADER,
    CONTENT_TYPE_HEADER,
    X_CONTENT_TYPE_HEADER,
    "te",
    "content-length",
    "grpc-encoding",
    "grpc-accept-encoding",
];

/// Case-insensitive string map. Keys are stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(HashMap<String, String>);

impl Metadata {
    /// Empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for `key`, ignoring case.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Sets `key`, replacing any previous value.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(key.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Removes and returns `key`.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(&key.to_ascii_lowercase())
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(key, value)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copies every entry of `other` over `self`.
    pub fn merge(&mut self, other: &Self) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }

    /// Converts into a plain map, e.g. for codec message headers.
    #[must_use]
    pub fn into_map(self) -> HashMap<String, String> {
        self.0
    }
}

impl From<HashMap<String, String>> for Metadata {
    fn from(map: HashMap<String, String>) -> Self {
        let mut md = Self::new();
        for (k, v) in map {
            md.insert(k, v);
        }
        md
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut md = Self::new();
        for (k, v) in iter {
            md.insert(k, v);
        }
        md
    }
}

/// Transport settings extracted from request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Negotiation {
    /// Content type that selects the codec.
    pub content_type: Option<String>,
    /// Transport content type, echoed on the response.
    pub transport_content_type: Option<String>,
    /// Call timeout.
    pub timeout: Option<Duration>,
}

/// Splits request headers into handler metadata and transport settings.
/// Binary (`-bin`) and non UTF-8 values are dropped.
#[must_use]
pub fn from_headers(headers: &HeaderMap) -> (Metadata, Negotiation) {
    let mut md = Metadata::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            md.insert(name.as_str(), v);
        }
    }
    let negotiation = extract(&mut md);
    (md, negotiation)
}

/// Removes transport headers from `md` and returns what they negotiated.
pub fn extract(md: &mut Metadata) -> Negotiation {
    let transport_content_type = md.get(CONTENT_TYPE_HEADER).map(str::to_string);
    let content_type = md
        .get(X_CONTENT_TYPE_HEADER)
        .map(str::to_string)
        .or_else(|| transport_content_type.clone());
    let timeout = md
        .get(TIMEOUT_HEADER)
        .and_then(parse_timeout)
        .or_else(|| md.get(GRPC_TIMEOUT_HEADER).and_then(parse_grpc_timeout));
    for key in TRANSPORT_HEADERS {
        md.remove(key);
    }
    Negotiation {
        content_type,
        transport_content_type,
        timeout,
    }
}

/// Parses the `timeout` header. Zero or unparsable values mean no deadline.
#[must_use]
pub fn parse_timeout(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|n| *n > 0)
        .map(Duration::from_nanos)
}

/// Longest `grpc-timeout` amount accepted on the wire.
const GRPC_TIMEOUT_DIGITS: usize = 8;

/// Parses a `grpc-timeout` value such as `250m` or `5S`.
///
/// Amounts longer than eight digits are rejected.
#[must_use]
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    let unit = value.chars().last()?;
    let digits = &value[..value.len() - unit.len_utf8()];
    if digits.is_empty()
        || digits.len() > GRPC_TIMEOUT_DIGITS
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let duration = match unit {
        'H' => Duration::from_secs(amount.saturating_mul(3600)),
        'M' => Duration::from_secs(amount.saturating_mul(60)),
        'S' => Duration::from_secs(amount),
        'm' => Duration::from_millis(amount),
        'u' => Duration::from_micros(amount),
        'n' => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration).filter(|d| !d.is_zero())
}
