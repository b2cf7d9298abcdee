use thiserror::Error;

use eventline_events::{BackendError, DataError, WireError};

/// Connection-facing failures.
///
/// Local conditions (one failed publish, one bad payload) come back to the
/// caller; `Fatal` means the whole connection has been torn down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A payload could not be encoded or decoded.
    #[error(transparent)]
    Encoding(#[from] DataError),

    /// An envelope could not be converted to or from wire bytes.
    #[error(transparent)]
    Wire(WireError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The connection is closed; nothing more can be published or subscribed.
    #[error("connection closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A subscription hit an unrecoverable condition and closed the connection.
    #[error("fatal error on {consumer}: {message}")]
    Fatal { consumer: String, message: String },
}

impl From<WireError> for Error {
    fn from(value: WireError) -> Self {
        match value {
            WireError::Data(e) => Error::Encoding(e),
            other => Error::Wire(other),
        }
    }
}

impl Error {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Error::InvalidConfig(message.into())
    }

    pub fn fatal(consumer: &str, message: impl core::fmt::Display) -> Self {
        Error::Fatal {
            consumer: consumer.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
