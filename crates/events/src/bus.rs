//! Backend collaborator boundary.
//!
//! This module describes what the library needs from a durable stream engine,
//! and nothing more:
//!
//! - **Ordered, durable storage** per named stream.
//! - **At-least-once delivery**: anything not acknowledged within the ack wait
//!   is delivered again, flagged `redelivered`.
//! - **Durable consumers** whose position survives a closed subscription and
//!   is discarded by unsubscribe.
//! - **An in-flight cap** per consumer; a cap of one gives strict order.
//!
//! Connection establishment, reconnects and physical storage are the
//! backend's own business. See [`InMemoryServer`](crate::InMemoryServer) for
//! the reference implementation and `eventline-infra` for a Redis Streams one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Backend failures, surfaced as-is to the caller of publish/subscribe.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("publish to {stream} failed: {message}")]
    Publish { stream: String, message: String },

    #[error("subscribe to {stream} failed: {message}")]
    Subscribe { stream: String, message: String },

    #[error("ack failed: {0}")]
    Ack(String),

    #[error("connection closed")]
    Closed,
}

impl BackendError {
    pub fn publish(stream: &str, message: impl core::fmt::Display) -> Self {
        Self::Publish {
            stream: stream.to_string(),
            message: message.to_string(),
        }
    }

    pub fn subscribe(stream: &str, message: impl core::fmt::Display) -> Self {
        Self::Subscribe {
            stream: stream.to_string(),
            message: message.to_string(),
        }
    }
}

/// Where a consumer with no stored position starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    /// Replay the whole retained backlog.
    #[default]
    First,
    /// Only messages published after subscribing.
    New,
}

/// Backend session connectivity, as reported by [`Backend::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Closed,
}

impl core::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Parameters of a queue subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    /// Queue group; members of one group share the stream's messages.
    pub group: String,
    /// Durable name; `None` for a position that lives only as long as the
    /// subscription.
    pub durable: Option<String>,
    pub start: StartPosition,
    /// How long the backend waits for an ack before redelivering.
    pub ack_wait: Duration,
    /// Maximum unacknowledged deliveries outstanding at once.
    pub max_inflight: usize,
}

/// Acknowledges one delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, sequence: u64) -> Result<(), BackendError>;
}

/// One delivery from the backend.
#[derive(Clone)]
pub struct RawMessage {
    pub data: Bytes,
    /// Position in the stream, starting at 1.
    pub sequence: u64,
    /// Backend-assigned timestamp.
    pub timestamp: DateTime<Utc>,
    /// Stream the message was read from.
    pub subject: String,
    pub redelivered: bool,
    acker: Arc<dyn Acker>,
}

impl RawMessage {
    pub fn new(
        data: Bytes,
        sequence: u64,
        timestamp: DateTime<Utc>,
        subject: impl Into<String>,
        redelivered: bool,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            data,
            sequence,
            timestamp,
            subject: subject.into(),
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), BackendError> {
        self.acker.ack(self.sequence).await
    }
}

impl core::fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RawMessage")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Control side of a backend subscription.
#[async_trait]
pub trait SubscriptionHandle: Send + Sync {
    /// Stop delivery, keeping the durable position.
    async fn close(&self) -> Result<(), BackendError>;

    /// Stop delivery and discard the durable position.
    async fn unsubscribe(&self) -> Result<(), BackendError>;
}

/// A live subscription: its control handle plus the delivery channel. The
/// channel ends when the subscription is closed.
pub struct BackendSubscription {
    pub handle: Box<dyn SubscriptionHandle>,
    pub messages: mpsc::Receiver<RawMessage>,
}

/// A session with the stream engine.
///
/// The trait requires `Send + Sync`; one session is shared by every publisher
/// and subscription of a connection.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Durably append `payload` to `stream`. Returns once the backend has
    /// accepted the write; nothing is written on error.
    async fn publish(&self, stream: &str, payload: Bytes) -> Result<(), BackendError>;

    async fn queue_subscribe(
        &self,
        stream: &str,
        request: SubscribeRequest,
    ) -> Result<BackendSubscription, BackendError>;

    fn status(&self) -> ConnectionStatus;

    /// Close the session and every subscription opened through it.
    async fn close(&self) -> Result<(), BackendError>;
}

#[async_trait]
impl<B> Backend for Arc<B>
where
    B: Backend + ?Sized,
{
    async fn publish(&self, stream: &str, payload: Bytes) -> Result<(), BackendError> {
        (**self).publish(stream, payload).await
    }

    async fn queue_subscribe(
        &self,
        stream: &str,
        request: SubscribeRequest,
    ) -> Result<BackendSubscription, BackendError> {
        (**self).queue_subscribe(stream, request).await
    }

    fn status(&self) -> ConnectionStatus {
        (**self).status()
    }

    async fn close(&self) -> Result<(), BackendError> {
        (**self).close().await
    }
}

/// Opens backend sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        cluster: &str,
        client_id: &str,
    ) -> Result<Arc<dyn Backend>, BackendError>;
}
