use chrono::{DateTime, Utc};
use serde::Serialize;

use eventline_codec::CodecRegistry;

use crate::data::Data;
use crate::envelope::{Envelope, fill_defaults, meta, nanos, payload, timestamp};
use crate::error::WireError;
use crate::wire::{EnvelopeRecord, non_empty};

/// A general-purpose envelope for traffic that is neither a fact nor a
/// command, correlated across a conversation by `correlation`.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Data>,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<Data>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<String>,
    /// Stream the message was received on.
    #[serde(skip_serializing_if = "Option::is_none")]
    topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ack_time: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            time: None,
            data: None,
            meta: None,
            correlation: None,
            cause: None,
            topic: None,
            client: None,
            ack_time: None,
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

    pub fn with_correlation(mut self, correlation: impl Into<String>) -> Self {
        self.correlation = Some(correlation.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn data(&self) -> Option<&Data> {
        self.data.as_ref()
    }

    pub fn meta(&self) -> Option<&Data> {
        self.meta.as_ref()
    }

    pub fn correlation(&self) -> Option<&str> {
        self.correlation.as_deref()
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn ack_time(&self) -> Option<DateTime<Utc>> {
        self.ack_time
    }

    pub fn set_ack_time(&mut self, ack_time: DateTime<Utc>) {
        self.ack_time = Some(ack_time);
    }
}

impl Envelope for Message {
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
            kind: self.kind.clone(),
            time: nanos(self.time)?,
            ack_time: nanos(self.ack_time)?,
            cause: self.cause.clone().unwrap_or_default(),
            client: self.client.clone().unwrap_or_default(),
            schema: payload.schema,
            encoding: payload.encoding,
            data: payload.data,
            meta: meta(self.meta.as_ref(), registry)?,
            correlation: self.correlation.clone().unwrap_or_default(),
            topic: self.topic.clone().unwrap_or_default(),
            ..Default::default()
        })
    }

    fn from_record(record: EnvelopeRecord) -> Result<Self, WireError> {
        let cause = record.primary_cause();
        Ok(Self {
            id: non_empty(record.id),
            kind: record.kind,
            time: timestamp(record.time),
            data: Data::from_wire(record.encoding, record.data, record.schema),
            meta: record.meta.and_then(Data::from_record),
            correlation: non_empty(record.correlation),
            cause,
            topic: non_empty(record.topic),
            client: non_empty(record.client),
            ack_time: timestamp(record.ack_time),
        })
    }
}
