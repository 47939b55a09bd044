//! Errors shared across the sync pipeline.
//!
//! Component-specific errors live next to their component
//! ([`AssemblyError`](crate::chunk::AssemblyError),
//! [`ListenerError`](crate::listener::ListenerError),
//! [`TransportError`](crate::transport::TransportError)); this module holds the
//! decode and configuration errors used by several modules, and [`SyncError`]
//! which aggregates everything the pipeline can report.

use thiserror::Error;

use crate::chunk::AssemblyError;
use crate::transport::TransportError;

/// A complete message could not be turned into a delta.
///
/// The message is dropped and the replica is left untouched.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("gzip decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("delta must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Invalid configuration. The only fatal error class: raised at construction,
/// before any connection attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("upstream endpoint is not configured")]
    MissingEndpoint,
    #[error("invalid upstream endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Everything the pipeline can report for a single inbound event.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
}
