//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Envelope did not carry exactly one message kind.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    // Handshake errors
    /// Key exchange did not complete.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// A frame carried a sequence number at or below the last accepted one.
    #[error("replayed frame: sequence {got} is not above {last}")]
    Replay {
        /// Last accepted sequence number.
        last: u64,
        /// Sequence number carried by the rejected frame.
        got: u64,
    },

    /// The sending counter has no values left.
    #[error("nonce space exhausted")]
    NonceExhausted,

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Underlying transport reported an error.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ProtocolError {
    /// Whether this error must terminate the connection.
    ///
    /// Crypto and framing failures are fatal; envelope-level problems are
    /// logged and the offending message dropped.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::Serialization(_)
                | ProtocolError::Deserialization(_)
                | ProtocolError::MalformedEnvelope(_)
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::Decryption(format!("invalid base64 frame: {err}"))
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Transport(err.to_string()),
        }
    }
}
