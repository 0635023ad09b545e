//! Vine Server - RPC server engine for the Vine microservices runtime.
//!
//! This crate multiplexes unary and streaming calls over one HTTP/2
//! transport, negotiates wire formats through a pluggable codec layer,
//! bridges broker messages to subscriber functions and keeps the service
//! registered with a discovery backend.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// Message broker collaborator.
pub mod broker;
/// Wire codecs and marshalers.
pub mod codec;
/// Per-call context.
pub mod context;
/// Framework and call errors.
pub mod error;
/// Infrastructure components (config, audit, telemetry, auxiliary HTTP).
pub mod infrastructure;
/// Call metadata and header negotiation.
pub mod metadata;
/// Service discovery collaborator.
pub mod registry;
/// The RPC server.
pub mod server;
/// Small shared helpers.
pub mod util;
