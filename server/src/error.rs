//! Error types shared by the dispatcher, subscribers and handlers.
//!
//! [`RpcError`] is the typed framework error a handler returns when it wants
//! the caller to see a specific status. [`CallError`] is what every call
//! boundary produces and knows how to turn itself into a [`tonic::Status`].

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use tonic::Code;

use crate::codec::CodecError;

/// Typed framework error carried across the wire as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RpcError {
    /// Identifier of the service or component that raised the error.
    #[serde(default)]
    pub id: String,
    /// HTTP-style status code.
    #[serde(default)]
    pub code: u16,
    /// Human readable detail.
    #[serde(default)]
    pub detail: String,
    /// Canonical reason phrase for `code`.
    #[serde(default)]
    pub status: String,
}

impl RpcError {
    /// Builds an error with an arbitrary code.
    #[must_use]
    pub fn new(id: impl Into<String>, code: u16, detail: impl Into<String>) -> Self {
        let status = StatusCode::from_u16(code)
            .ok()
            .and_then(|c| c.canonical_reason())
            .unwrap_or_default()
            .to_string();
        Self {
            id: id.into(),
            code,
            detail: detail.into(),
            status,
        }
    }

    /// Parses the JSON form produced by `to_string`. Text that is not a JSON
    /// encoded error becomes the detail of a code-less error.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        serde_json::from_str::<Self>(text)
            .ok()
            .filter(|e| e.code != 0 || !e.id.is_empty())
            .unwrap_or_else(|| Self {
                detail: text.to_string(),
                ..Self::default()
            })
    }

    /// 400
    #[must_use]
    pub fn bad_request(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, 400, detail)
    }

    /// 401
    #[must_use]
    pub fn unauthorized(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, 401, detail)
    }

    /// 403
    #[must_use]
    pub fn forbidden(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, 403, detail)
    }

    /// 404
    #[must_use]
    pub fn not_found(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, 404, detail)
    }

    /// 405
    #[must_use]
    pub fn method_not_allowed(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, 405, detail)
    }

    /// 408
    #[must_use]
    pub fn timeout(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, 408, detail)
    }

    /// 409
    #[must_use]
    pub fn conflict(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, 409, detail)
    }

    /// 412
    #[must_use]
    pub fn precondition_failed(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, 412, detail)
    }

    /// 429
    #[must_use]
    pub fn too_many_requests(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, 429, detail)
    }

    /// 500
    #[must_use]
    pub fn internal_server_error(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, 500, detail)
    }

    /// 501
    #[must_use]
    pub fn not_implemented(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, 501, detail)
    }

    /// 502
    #[must_use]
    pub fn bad_gateway(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, 502, detail)
    }

    /// 503
    #[must_use]
    pub fn service_unavailable(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, 503, detail)
    }

    /// 504
    #[must_use]
    pub fn gateway_timeout(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, 504, detail)
    }

    /// Protocol status code for this error's HTTP-style code.
    #[must_use]
    pub fn grpc_code(&self) -> Code {
        match self.code {
            400 => Code::InvalidArgument,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 | 405 => Code::NotFound,
            408 => Code::Cancelled,
            504 => Code::DeadlineExceeded,
            409 => Code::AlreadyExists,
            412 => Code::FailedPrecondition,
            429 => Code::ResourceExhausted,
            500 => Code::Internal,
            501 => Code::Unimplemented,
            502 => Code::OutOfRange,
            503 => Code::Unavailable,
            _ => Code::Unknown,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{} {}: {}", self.code, self.status, self.detail),
        }
    }
}

impl std::error::Error for RpcError {}

/// Failure of a single call, subscriber invocation or stream operation.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Typed framework error returned by a handler.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// Low level I/O failure.
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// Encoding, decoding or codec selection failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The call context was cancelled.
    #[error("context canceled")]
    Canceled,
    /// The call deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    /// The method path could not be parsed.
    #[error("malformed method name: {0:?}")]
    MalformedMethod(String),
    /// No service is registered under this name.
    #[error("unknown service {0}")]
    UnknownService(String),
    /// The service exists but has no such method.
    #[error("unknown method {method} for service {service}")]
    UnknownMethod {
        /// Service name.
        service: String,
        /// Method name.
        method: String,
    },
    /// The handler panicked.
    #[error("panic recovered: {message}")]
    Panic {
        /// Panic payload rendered as text.
        message: String,
        /// Stack captured at the panic site.
        backtrace: String,
    },
    /// The peer answered with a non-OK status.
    #[error("status: {0}")]
    Status(#[from] tonic::Status),
    /// Any other handler error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CallError {
    /// Protocol status code for this error.
    #[must_use]
    pub fn code(&self) -> Code {
        match self {
            Self::Rpc(e) => e.grpc_code(),
            Self::Io(e) => io_code(e),
            Self::Codec(CodecError::Io(e)) => io_code(e),
            Self::Codec(CodecError::UnexpectedEof) => Code::OutOfRange,
            Self::Codec(_) | Self::Panic { .. } => Code::Internal,
            Self::Canceled => Code::Cancelled,
            Self::DeadlineExceeded => Code::DeadlineExceeded,
            Self::MalformedMethod(_) => Code::InvalidArgument,
            Self::UnknownService(_) | Self::UnknownMethod { .. } => Code::Unimplemented,
            Self::Status(s) => s.code(),
            Self::Other(e) => e
                .downcast_ref::<RpcError>()
                .map(RpcError::grpc_code)
                .or_else(|| e.downcast_ref::<io::Error>().map(io_code))
                .unwrap_or(Code::Unknown),
        }
    }

    /// Converts the error into the status sent in the response trailers.
    /// Typed errors travel as their JSON encoding so peers can parse them back.
    #[must_use]
    pub fn to_status(&self) -> tonic::Status {
        let message = match self {
            Self::Status(s) => return s.clone(),
            Self::Panic { message, backtrace } => {
                format!("panic recovered: {message}\n{backtrace}")
            }
            other => other.to_string(),
        };
        tonic::Status::new(self.code(), message)
    }
}

fn io_code(e: &io::Error) -> Code {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => Code::OutOfRange,
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected => Code::FailedPrecondition,
        io::ErrorKind::PermissionDenied => Code::PermissionDenied,
        io::ErrorKind::AlreadyExists => Code::AlreadyExists,
        io::ErrorKind::NotFound => Code::NotFound,
        io::ErrorKind::TimedOut => Code::DeadlineExceeded,
        _ => Code::Unknown,
    }
}
