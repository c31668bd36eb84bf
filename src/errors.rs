// src/errors.rs

use std::time::Duration;
use thiserror::Error;

/// Boxed error type used at the codec and handler seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to encode payload as '{content_type}': {source}")]
    Encoding {
        content_type: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to decode '{content_type}' payload: {source}")]
    Decoding {
        content_type: String,
        #[source]
        source: BoxError,
    },

    #[error("no codec registered for content type '{0}'")]
    UnknownCodec(String),

    #[error("no content type given and no default codec configured")]
    NoDefaultCodec,

    #[error("codec for '{0}' is already registered")]
    DuplicateCodec(String),

    #[error("outbound buffer full, {0} messages already pending")]
    Backpressure(usize),

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("connection lost while waiting for broker ack")]
    ConnectionLost,

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("timed out after {0:?} waiting for broker ack")]
    PublishTimeout(Duration),

    #[error("consume error: {0}")]
    Consume(String),

    #[error("handler failed: {0}")]
    Handler(String),
}

// Custom Result type for client operations
pub type Result<T> = std::result::Result<T, Error>;

// Converting from lapin errors at the transport boundary
impl From<lapin::Error> for Error {
    fn from(error: lapin::Error) -> Self {
        let text = error.to_string();
        if text.contains("channel") {
            Error::Channel(text)
        } else {
            Error::Connection(text)
        }
    }
}

impl Error {
    /// Collapses transport-level failures into the error a waiter on a
    /// broker ack should see. Payload errors pass through untouched.
    pub(crate) fn into_connection_lost(self) -> Error {
        match self {
            Error::Connection(_) | Error::Channel(_) => Error::ConnectionLost,
            other => other,
        }
    }
}
