//! Protobuf wire records.
//!
//! Every envelope travels as an [`EnvelopeRecord`]; the payload inside it is an
//! opaque byte field tagged with the encoding that produced it. Field numbers
//! are part of the wire contract and must never be reused.

use bytes::Bytes;

/// A tagged payload (used for nested `meta` and for reply payloads).
#[derive(Clone, PartialEq, prost::Message)]
pub struct DataRecord {
    #[prost(string, tag = "1")]
    pub schema: String,
    #[prost(string, tag = "2")]
    pub encoding: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub data: Bytes,
}

/// Outer record shared by events, commands and messages.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EnvelopeRecord {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub kind: String,
    /// Producer wall-clock, nanoseconds since the epoch.
    #[prost(int64, tag = "3")]
    pub time: i64,
    /// Backend acknowledgment time, nanoseconds since the epoch.
    #[prost(int64, tag = "4")]
    pub ack_time: i64,
    #[prost(string, tag = "5")]
    pub cause: String,
    /// Multi-cause form; only read, never written.
    #[prost(string, repeated, tag = "6")]
    pub causes: Vec<String>,
    #[prost(string, tag = "7")]
    pub client: String,
    #[prost(string, tag = "8")]
    pub aggregate: String,
    #[prost(string, tag = "9")]
    pub schema: String,
    #[prost(string, tag = "10")]
    pub encoding: String,
    #[prost(bytes = "bytes", tag = "11")]
    pub data: Bytes,
    #[prost(message, optional, tag = "12")]
    pub meta: Option<DataRecord>,
    #[prost(string, tag = "13")]
    pub correlation: String,
    #[prost(string, tag = "14")]
    pub topic: String,
}

impl EnvelopeRecord {
    /// The single cause of this record, preferring `cause` over the first
    /// entry of `causes`.
    pub fn primary_cause(&self) -> Option<String> {
        if !self.cause.is_empty() {
            return Some(self.cause.clone());
        }
        self.causes.iter().find(|c| !c.is_empty()).cloned()
    }
}

/// Reply to a command.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReplyRecord {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, optional, tag = "3")]
    pub data: Option<DataRecord>,
    #[prost(message, optional, tag = "4")]
    pub meta: Option<DataRecord>,
}

/// Map an empty wire string to `None`.
pub(crate) fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}
