use chrono::{DateTime, Utc};
use serde::Serialize;

use eventline_codec::CodecRegistry;

use crate::data::Data;
use crate::envelope::{Envelope, fill_defaults, meta, nanos, payload, timestamp};
use crate::error::WireError;
use crate::wire::{EnvelopeRecord, non_empty};

/// A fact that happened, as published to a stream.
///
/// Events are:
/// - **immutable** once sent (subscribers get a fresh copy per delivery)
/// - linked to the event that caused them through `cause`
/// - optionally scoped to one domain entity through `aggregate`
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Data>,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<Data>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    aggregate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ack_time: Option<DateTime<Utc>>,
    #[serde(skip)]
    delivery: Option<Delivery>,
}

/// Where and how a received event was delivered. Never on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub stream: String,
    pub sequence: u64,
    /// Backend acknowledgment timestamp.
    pub timestamp: DateTime<Utc>,
    pub redelivered: bool,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            time: None,
            data: None,
            meta: None,
            cause: None,
            aggregate: None,
            client: None,
            ack_time: None,
            delivery: None,
        }
    }

    /// An event with a caller-chosen id.
    pub fn with_id(event_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(event_type)
        }
    }

    /// Producer time. The Unix epoch is reserved for "unset" on the wire and
    /// fails to marshal.
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_data(mut self, data: Data) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_meta(mut self, meta: Data) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_aggregate(mut self, aggregate: impl Into<String>) -> Self {
        self.aggregate = Some(aggregate.into());
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// True if this event's type is any of `types`.
    pub fn is(&self, types: &[&str]) -> bool {
        types.iter().any(|t| *t == self.event_type)
    }

    pub fn data(&self) -> Option<&Data> {
        self.data.as_ref()
    }

    pub fn data_mut(&mut self) -> Option<&mut Data> {
        self.data.as_mut()
    }

    pub fn meta(&self) -> Option<&Data> {
        self.meta.as_ref()
    }

    pub fn aggregate(&self) -> Option<&str> {
        self.aggregate.as_deref()
    }

    pub fn ack_time(&self) -> Option<DateTime<Utc>> {
        self.ack_time
    }

    pub fn delivery(&self) -> Option<&Delivery> {
        self.delivery.as_ref()
    }

    /// Attach backend delivery details to a received event.
    pub fn set_delivery(&mut self, delivery: Delivery) {
        self.ack_time = Some(delivery.timestamp);
        self.delivery = Some(delivery);
    }
}

impl Envelope for Event {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn time(&self) -> Option<DateTime<Utc>> {
        self.time
    }

    fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }

    fn stamp_client(&mut self, client: &str) {
        self.client = Some(client.to_string());
    }

    fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    fn set_cause(&mut self, cause: &str) {
        self.cause = Some(cause.to_string());
    }

    fn ensure_defaults(&mut self) {
        fill_defaults(&mut self.id, &mut self.time);
    }

    fn to_record(&self, registry: &CodecRegistry) -> Result<EnvelopeRecord, WireError> {
        let payload = payload(self.data.as_ref(), registry)?;
        Ok(EnvelopeRecord {
            id: self.id.clone().unwrap_or_default(),
            kind: self.event_type.clone(),
            time: nanos(self.time)?,
            ack_time: nanos(self.ack_time)?,
            cause: self.cause.clone().unwrap_or_default(),
            client: self.client.clone().unwrap_or_default(),
            aggregate: self.aggregate.clone().unwrap_or_default(),
            schema: payload.schema,
            encoding: payload.encoding,
            data: payload.data,
            meta: meta(self.meta.as_ref(), registry)?,
            ..Default::default()
        })
    }

    fn from_record(record: EnvelopeRecord) -> Result<Self, WireError> {
        let cause = record.primary_cause();
        Ok(Self {
            id: non_empty(record.id),
            event_type: record.kind,
            time: timestamp(record.time),
            data: Data::from_wire(record.encoding, record.data, record.schema),
            meta: record.meta.and_then(Data::from_record),
            cause,
            aggregate: non_empty(record.aggregate),
            client: non_empty(record.client),
            ack_time: timestamp(record.ack_time),
            delivery: None,
        })
    }
}
