use thiserror::Error;

/// Codec failures.
///
/// Unknown encodings and shape mismatches are surfaced to the caller of
/// marshal/decode; nothing is silently dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// No codec is registered under this encoding name.
    #[error("no codec for {0}")]
    UnknownEncoding(String),

    /// The value or decode target does not have the shape the codec requires.
    #[error("{codec} codec: {expected} required")]
    TypeMismatch {
        codec: &'static str,
        expected: &'static str,
    },

    /// The value could not be encoded.
    #[error("{codec} codec: encode failed: {message}")]
    Encode { codec: &'static str, message: String },

    /// The bytes could not be decoded.
    #[error("{codec} codec: decode failed: {message}")]
    Decode { codec: &'static str, message: String },
}

impl CodecError {
    pub fn unknown(encoding: impl Into<String>) -> Self {
        Self::UnknownEncoding(encoding.into())
    }

    pub fn mismatch(codec: &'static str, expected: &'static str) -> Self {
        Self::TypeMismatch { codec, expected }
    }

    pub fn encode(codec: &'static str, err: impl core::fmt::Display) -> Self {
        Self::Encode {
            codec,
            message: err.to_string(),
        }
    }

    pub fn decode(codec: &'static str, err: impl core::fmt::Display) -> Self {
        Self::Decode {
            codec,
            message: err.to_string(),
        }
    }
}
