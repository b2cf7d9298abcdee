//! Outer envelope serialization.
//!
//! Two layers: the envelope fields go into an [`EnvelopeRecord`] (protobuf),
//! while `data`/`meta` are encoded separately by their own codec and carried
//! as opaque bytes with an encoding tag.
//!
//! Notes:
//! - `id` and `time` are filled in on the first marshal if absent and never
//!   changed afterwards.
//! - `time` is producer wall-clock only; ordering comes from stream position.
//! - Unmarshal leaves `data`/`meta` encoded until the consumer decodes them.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use prost::Message as _;

use eventline_codec::CodecRegistry;
use eventline_core::{from_unix_nanos, next_id, to_unix_nanos};

use crate::data::{Data, record_of};
use crate::error::WireError;
use crate::wire::EnvelopeRecord;

mod sealed {
    pub trait Sealed {}

    impl Sealed for crate::event::Event {}
    impl Sealed for crate::command::Command {}
    impl Sealed for crate::message::Message {}
}

/// An envelope that travels as an [`EnvelopeRecord`].
///
/// Implemented by [`Event`](crate::Event), [`Command`](crate::Command) and
/// [`Message`](crate::Message) only.
pub trait Envelope: sealed::Sealed + Sized {
    fn id(&self) -> Option<&str>;

    fn time(&self) -> Option<DateTime<Utc>>;

    /// Identifier of the producing connection.
    fn client(&self) -> Option<&str>;

    /// Stamp the producing connection. The publisher calls this on every
    /// publish, replacing whatever was set before.
    #[doc(hidden)]
    fn stamp_client(&mut self, client: &str);

    /// Id of the envelope that caused this one.
    fn cause(&self) -> Option<&str>;

    fn set_cause(&mut self, cause: &str);

    /// Assign `id` and `time` if they are not set yet.
    fn ensure_defaults(&mut self);

    fn to_record(&self, registry: &CodecRegistry) -> Result<EnvelopeRecord, WireError>;

    fn from_record(record: EnvelopeRecord) -> Result<Self, WireError>;

    /// Finalize `id`/`time` and serialize to wire bytes.
    fn marshal(&mut self, registry: &CodecRegistry) -> Result<Vec<u8>, WireError> {
        self.ensure_defaults();
        Ok(self.to_record(registry)?.encode_to_vec())
    }

    /// Rebuild from wire bytes; the payload stays encoded.
    fn unmarshal(bytes: &[u8]) -> Result<Self, WireError> {
        Self::from_record(EnvelopeRecord::decode(bytes)?)
    }
}

pub(crate) fn fill_defaults(id: &mut Option<String>, time: &mut Option<DateTime<Utc>>) {
    if id.is_none() {
        *id = Some(next_id());
    }
    if time.is_none() {
        *time = Some(Utc::now());
    }
}

pub(crate) fn nanos(time: Option<DateTime<Utc>>) -> Result<i64, WireError> {
    match time {
        Some(t) => Ok(to_unix_nanos(t)?),
        None => Ok(0),
    }
}

pub(crate) fn timestamp(nanos: i64) -> Option<DateTime<Utc>> {
    from_unix_nanos(nanos)
}

/// Payload fields as they sit directly on the envelope record.
pub(crate) struct Payload {
    pub schema: String,
    pub encoding: String,
    pub data: Bytes,
}

pub(crate) fn payload(data: Option<&Data>, registry: &CodecRegistry) -> Result<Payload, WireError> {
    let record = record_of(data, registry)?;
    Ok(Payload {
        schema: record.schema,
        encoding: record.encoding,
        data: record.data,
    })
}

pub(crate) fn meta(
    meta: Option<&Data>,
    registry: &CodecRegistry,
) -> Result<Option<crate::wire::DataRecord>, WireError> {
    match meta {
        Some(m) => Ok(Some(m.to_record(registry)?)),
        None => Ok(None),
    }
}
