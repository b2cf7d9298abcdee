use thiserror::Error;

use eventline_codec::CodecError;
use eventline_core::CoreError;

/// Failures encoding or decoding a [`Data`](crate::Data) payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataError {
    /// A value is present but no encoding was named for it.
    #[error("no encoding specified")]
    NoEncoding,

    /// Decode was called on data that never received encoded bytes.
    #[error("no data to decode")]
    NoData,

    /// The codec lookup or the codec itself failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A typed value could not be converted to or from the codec's value model.
    #[error("value conversion failed: {0}")]
    Convert(String),
}

/// Failures converting an envelope to or from its wire record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The bytes are not a valid envelope record.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Time(#[from] CoreError),
}

impl From<prost::DecodeError> for WireError {
    fn from(value: prost::DecodeError) -> Self {
        WireError::Malformed(value.to_string())
    }
}

impl From<CodecError> for WireError {
    fn from(value: CodecError) -> Self {
        WireError::Data(DataError::Codec(value))
    }
}
