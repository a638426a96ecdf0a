//! Error types for the probe client.
//!
//! Only transport faults are errors. Server-reported `ERROR`,
//! `CLIENT_ERROR` and `SERVER_ERROR` lines are reply data and never
//! surface here.

use std::io;
use thiserror::Error;

/// Result type alias using `ClientError`
pub type Result<T> = std::result::Result<T, ClientError>;

/// Transport-level failures raised by a client connection
#[derive(Debug, Error)]
pub enum ClientError {
    /// Endpoint refused, timed out, or could not be resolved
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// An operation needed a socket but the connection is closed
    #[error("not connected")]
    NotConnected,

    /// Peer closed the socket before a reply line was complete
    #[error("connection closed by peer while reading reply")]
    ConnectionClosed,

    /// `recv` was called without a preceding `send`
    #[error("no pending request to collect a reply for")]
    NoPendingRequest,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
