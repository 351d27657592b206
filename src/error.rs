//! Error types for hids-stream.

use thiserror::Error;

/// Boxed cause reported by an upstream producer.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for hids-stream operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The upstream producer reported a failure.
    #[error("Upstream query failed: {0}")]
    Upstream(#[source] BoxError),

    /// The sequence was cancelled by the caller.
    #[error("Operation was cancelled")]
    Cancelled,

    /// The destination buffer cannot hold even one encoded character.
    #[error("Buffer too small: need {needed} bytes, got {available}")]
    BufferTooSmall {
        /// Bytes needed for the next character.
        needed: usize,
        /// Bytes available in the destination.
        available: usize,
    },

    /// Encoded histogram data is not decodable.
    #[error("Malformed histogram data: {message}")]
    Malformed {
        /// Description of what is wrong with the payload.
        message: String,
    },

    /// Failed to render a value as JSON.
    #[error("Failed to serialize value: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error during streaming.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap any producer-side failure as [`Error::Upstream`].
    pub fn upstream(cause: impl Into<BoxError>) -> Self {
        Error::Upstream(cause.into())
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Error::Malformed {
            message: message.into(),
        }
    }

    /// Returns true for [`Error::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::Cancelled => std::io::Error::new(std::io::ErrorKind::Interrupted, err),
            Error::BufferTooSmall { .. } => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, err)
            }
            Error::Malformed { .. } => std::io::Error::new(std::io::ErrorKind::InvalidData, err),
            other => std::io::Error::other(other),
        }
    }
}

/// Result type alias for hids-stream operations.
pub type Result<T> = std::result::Result<T, Error>;
