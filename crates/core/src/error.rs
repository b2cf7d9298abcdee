//! Core error model.

use thiserror::Error;

/// Result type used by the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while converting identity or time values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A timestamp cannot be represented as nanoseconds since the Unix epoch.
    #[error("timestamp out of range: {0}")]
    TimeOutOfRange(String),

    /// The Unix epoch itself encodes "not set" on the wire.
    #[error("timestamp at the unix epoch is reserved for unset")]
    EpochReserved,
}

impl CoreError {
    pub fn time_out_of_range(msg: impl Into<String>) -> Self {
        Self::TimeOutOfRange(msg.into())
    }
}
