//! Client error types.

use qwire_protocol::ErrorCode;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] qwire_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connect already in progress")]
    AlreadyConnecting,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("correlation id {0} already has a pending request")]
    IdInUse(u16),

    #[error("server error: {code} - {message}")]
    Server { code: ErrorCode, message: String },

    #[error("unexpected response type {tag} for correlation id {id}")]
    UnexpectedResponse { id: u16, tag: u8 },

    #[error("failed to spawn pipe command: {0}")]
    Spawn(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::NotConnected => true,
            ClientError::Server { code, .. } => code.is_retryable(),
            _ => false,
        }
    }

    /// Returns whether this error ended (or came from the end of) a connection.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            ClientError::Io(_) | ClientError::ConnectionClosed => true,
            ClientError::Protocol(e) => e.is_fatal(),
            _ => false,
        }
    }
}
