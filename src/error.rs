//! Common error types for rxd-stratum-proxy.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.

use thiserror::Error;

/// Main error type for proxy operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors talking to the Radiant node's JSON-RPC interface
    #[error("node RPC error: {0}")]
    NodeRpc(#[from] reqwest::Error),

    /// The node returned a JSON-RPC level error object
    #[error("node RPC returned error: {0}")]
    NodeRpcResponse(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Stratum protocol errors (malformed request, unknown method, ...)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The template is not yet ready to serve jobs (no payout address, no
    /// block fetched yet, ...)
    #[error("template not ready: {0}")]
    TemplateNotReady(String),

    /// ZMQ transport errors
    #[error("zmq error: {0}")]
    Zmq(String),

    /// Generic catch-all, used sparingly
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
