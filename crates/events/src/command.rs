use chrono::{DateTime, Utc};
use serde::Serialize;

use eventline_codec::CodecRegistry;

use crate::data::Data;
use crate::envelope::{Envelope, fill_defaults, meta, nanos, payload, timestamp};
use crate::error::WireError;
use crate::wire::{EnvelopeRecord, non_empty};

/// A request to change one aggregate.
///
/// Commands are addressed to an aggregate and answered with a
/// [`Reply`](crate::Reply).
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "type")]
    command_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    aggregate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Data>,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<Data>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client: Option<String>,
}

impl Command {
    pub fn new(command_type: impl Into<String>, aggregate: impl Into<String>) -> Self {
        Self {
            id: None,
            command_type: command_type.into(),
            time: None,
            aggregate: Some(aggregate.into()),
            data: None,
            meta: None,
            cause: None,
            client: None,
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

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn command_type(&self) -> &str {
        &self.command_type
    }

    pub fn aggregate(&self) -> Option<&str> {
        self.aggregate.as_deref()
    }

    pub fn data(&self) -> Option<&Data> {
        self.data.as_ref()
    }

    pub fn meta(&self) -> Option<&Data> {
        self.meta.as_ref()
    }
}

impl Envelope for Command {
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
            kind: self.command_type.clone(),
            time: nanos(self.time)?,
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
            command_type: record.kind,
            time: timestamp(record.time),
            aggregate: non_empty(record.aggregate),
            data: Data::from_wire(record.encoding, record.data, record.schema),
            meta: record.meta.and_then(Data::from_record),
            cause,
            client: non_empty(record.client),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_aggregate_and_payload() {
        let registry = CodecRegistry::standard();
        let mut cmd = Command::new("withdraw", "account-7")
            .with_data(Data::string("10"))
            .with_cause("evt-1");
        cmd.stamp_client("teller");

        let back = Command::unmarshal(&cmd.marshal(&registry).unwrap()).unwrap();
        assert_eq!(back.id(), cmd.id());
        assert_eq!(back.command_type(), "withdraw");
        assert_eq!(back.aggregate(), Some("account-7"));
        assert_eq!(back.cause(), Some("evt-1"));
        assert_eq!(back.client(), Some("teller"));
        assert_eq!(back.time(), cmd.time());
        let amount: String = back.data().unwrap().decode(&registry).unwrap();
        assert_eq!(amount, "10");
    }
}
