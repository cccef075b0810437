//! Error types for the Pub/Sub runtime.

use thiserror::Error;
use tonic::Code;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The remote service answered with a non-OK status.
    #[error("RPC error: {0}")]
    Rpc(#[from] tonic::Status),

    /// The shared channel has been torn down.
    #[error("RPC channel is closed")]
    ChannelClosed,

    /// Channel construction failed.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// A message body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A message body could not be encoded.
    #[error("Encode error: {0}")]
    Encode(String),

    /// The operation was cancelled by a shutdown signal.
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The remote status code carried by this error, if any.
    pub fn code(&self) -> Option<Code> {
        match self {
            Error::Rpc(status) => Some(status.code()),
            _ => None,
        }
    }

    /// True when the remote service reported `ALREADY_EXISTS`.
    pub fn is_already_exists(&self) -> bool {
        self.code() == Some(Code::AlreadyExists)
    }

    /// True when the remote service reported `NOT_FOUND`.
    pub fn is_not_found(&self) -> bool {
        self.code() == Some(Code::NotFound)
    }

    /// True for network-level failures worth retrying with backoff.
    ///
    /// Semantic errors (already-exists, not-found, invalid argument, ...) are
    /// never transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code(),
            Some(Code::Unavailable)
                | Some(Code::DeadlineExceeded)
                | Some(Code::Aborted)
                | Some(Code::ResourceExhausted)
        )
    }
}

/// Validation error types.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Invalid topic ID.
    #[error("Invalid topic ID: {0}")]
    InvalidTopicId(String),

    /// Invalid subscription ID.
    #[error("Invalid subscription ID: {0}")]
    InvalidSubscriptionId(String),

    /// Publish was called without any messages.
    #[error("Cannot publish an empty batch of messages")]
    EmptyBatch,
}
