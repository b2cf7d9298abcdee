use core::fmt;

use prost::Message as _;
use serde::Serialize;

use eventline_codec::CodecRegistry;

use crate::data::Data;
use crate::error::WireError;
use crate::wire::ReplyRecord;

/// Status code of a [`Reply`].
///
/// Open set: any `i32` round-trips, the constants are the ones this crate
/// knows how to name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Code(pub i32);

impl Code {
    pub const OK: Code = Code(0);
    pub const INVALID: Code = Code(1);
    pub const NOT_FOUND: Code = Code(2);
    pub const CONFLICT: Code = Code(3);
    pub const UNAVAILABLE: Code = Code(4);
    pub const INTERNAL: Code = Code(5);

    pub fn is_ok(self) -> bool {
        self == Code::OK
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Code::OK => f.write_str("ok"),
            Code::INVALID => f.write_str("invalid"),
            Code::NOT_FOUND => f.write_str("not found"),
            Code::CONFLICT => f.write_str("conflict"),
            Code::UNAVAILABLE => f.write_str("unavailable"),
            Code::INTERNAL => f.write_str("internal"),
            Code(other) => write!(f, "code {other}"),
        }
    }
}

/// Answer to a [`Command`](crate::Command).
#[derive(Debug, Clone, Default, Serialize)]
pub struct Reply {
    pub code: Code,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Data>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Data>,
}

impl Reply {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: Data) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_meta(mut self, meta: Data) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn marshal(&self, registry: &CodecRegistry) -> Result<Vec<u8>, WireError> {
        let record = ReplyRecord {
            code: self.code.0,
            message: self.message.clone(),
            data: self.data.as_ref().map(|d| d.to_record(registry)).transpose()?,
            meta: self.meta.as_ref().map(|m| m.to_record(registry)).transpose()?,
        };
        Ok(record.encode_to_vec())
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, WireError> {
        let record = ReplyRecord::decode(bytes)?;
        Ok(Self {
            code: Code(record.code),
            message: record.message,
            data: record.data.and_then(Data::from_record),
            meta: record.meta.and_then(Data::from_record),
        })
    }
}
