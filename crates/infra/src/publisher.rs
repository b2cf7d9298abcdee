//! Publish path: stamp, marshal, append.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument};

use eventline_codec::CodecRegistry;
use eventline_events::{Backend, Data, Envelope, Event};

use crate::connection::Connection;
use crate::error::Result;

/// Marshals envelopes for one client and appends them to the backend.
pub(crate) struct Publisher {
    client_id: String,
    backend: Arc<dyn Backend>,
    registry: Arc<CodecRegistry>,
}

impl Publisher {
    pub(crate) fn new(
        client_id: String,
        backend: Arc<dyn Backend>,
        registry: Arc<CodecRegistry>,
    ) -> Self {
        Self {
            client_id,
            backend,
            registry,
        }
    }

    /// Stamp the client, assign `id`/`time` if absent, and append to
    /// `stream`. Returns the envelope id.
    #[instrument(skip(self, envelope), fields(client = %self.client_id), err)]
    pub(crate) async fn publish<E>(&self, stream: &str, envelope: &mut E) -> Result<String>
    where
        E: Envelope + Send,
    {
        envelope.stamp_client(&self.client_id);
        let bytes = envelope.marshal(&self.registry)?;
        let id = envelope.id().unwrap_or_default().to_string();

        self.backend.publish(stream, Bytes::from(bytes)).await?;
        debug!(stream, event_id = %id, "published");
        Ok(id)
    }
}

impl Connection {
    /// Publish `envelope` to `stream`.
    ///
    /// On return the backend has durably accepted the write; subscribers have
    /// not necessarily seen it. The envelope keeps the id and time assigned
    /// here, so publishing it again is a duplicate of the same envelope.
    pub async fn publish<E>(&self, stream: &str, envelope: &mut E) -> Result<String>
    where
        E: Envelope + Send,
    {
        self.ensure_open()?;
        self.publisher().publish(stream, envelope).await
    }

    /// Publish with `cause` recorded as the upstream envelope id.
    pub async fn publish_with_cause<E>(
        &self,
        stream: &str,
        envelope: &mut E,
        cause: Option<&str>,
    ) -> Result<String>
    where
        E: Envelope + Send,
    {
        if let Some(cause) = cause {
            envelope.set_cause(cause);
        }
        self.publish(stream, envelope).await
    }

    /// Build and publish an event from a type and an optional payload.
    pub async fn emit(
        &self,
        stream: &str,
        event_type: &str,
        data: Option<Data>,
    ) -> Result<String> {
        let mut event = Event::new(event_type);
        if let Some(data) = data {
            event = event.with_data(data);
        }
        self.publish(stream, &mut event).await
    }
}
