//! Error types for nsq-client.

use thiserror::Error;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum NsqError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (IDENTIFY, AUTH, lookupd).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error talking to a lookupd.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// TLS setup or handshake error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid configuration, rejected at construction.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The IDENTIFY/AUTH/feature negotiation failed.
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Malformed frame or unexpected protocol state.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error frame sent by the server.
    #[error("Server error {code}: {message}")]
    Server {
        /// Error code, e.g. `E_BAD_TOPIC`.
        code: String,
        /// Remainder of the error frame.
        message: String,
    },

    /// An operation did not complete in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The connection is closed or closing.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A [`Channel`](crate::chan::Channel) was closed.
    #[error("Channel closed")]
    ChannelClosed,

    /// A publish was not acknowledged with `OK`.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Topic or channel name is not valid.
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// The message is not tracked as in-flight on its connection.
    #[error("Message {0} is not in flight")]
    NotInFlight(String),

    /// The message was already finished or requeued.
    #[error("Message {0} already responded")]
    AlreadyResponded(String),

    /// The consumer or producer has been stopped.
    #[error("Stopped")]
    Stopped,

    /// No handler registered before connecting.
    #[error("No handler registered")]
    NoHandler,

    /// Lookupd query failed.
    #[error("Lookup error: {0}")]
    Lookup(String),
}

impl NsqError {
    /// Whether this error closes the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        match self {
            NsqError::Server { code, .. } => crate::protocol::is_fatal_error_code(code),
            NsqError::NotInFlight(_)
            | NsqError::AlreadyResponded(_)
            | NsqError::Publish(_)
            | NsqError::InvalidName(_) => false,
            _ => true,
        }
    }
}

/// Result type alias using NsqError.
pub type Result<T> = std::result::Result<T, NsqError>;
