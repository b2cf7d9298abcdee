//! Handler contract for subscriptions.
//!
//! A handler gets the decoded event, a context carrying the ack deadline, and
//! the connection it was delivered on (so it can publish follow-up events with
//! the delivered event as their cause).
//!
//! Outcomes:
//! - `Ok(())`: the delivery is acknowledged.
//! - [`HandlerError::Failed`]: logged, not acknowledged; the backend redelivers
//!   after the ack timeout. Handlers must therefore be idempotent.
//! - [`HandlerError::Fatal`] (or a panic): the connection is closed, with every
//!   sibling subscription, and [`Connection::wait`](crate::Connection::wait)
//!   returns the error.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use eventline_events::{DataError, Event};

use crate::connection::Connection;
use crate::error::Error;

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Ordinary failure; the delivery will be retried.
    #[error("handler failed: {0}")]
    Failed(anyhow::Error),

    /// Unrecoverable; the connection shuts down.
    #[error("handler fatal error: {0}")]
    Fatal(anyhow::Error),
}

impl HandlerError {
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::Failed(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::Fatal(err.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::Fatal(_))
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(value: anyhow::Error) -> Self {
        HandlerError::Failed(value)
    }
}

impl From<Error> for HandlerError {
    fn from(value: Error) -> Self {
        HandlerError::Failed(value.into())
    }
}

impl From<DataError> for HandlerError {
    fn from(value: DataError) -> Self {
        HandlerError::Failed(value.into())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Per-delivery context.
///
/// The deadline is advisory: it is signalled through [`cancelled`](Self::cancelled)
/// but a handler that ignores it keeps running, possibly alongside a
/// redelivery of the same message.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    cancel: CancellationToken,
    deadline: Instant,
}

impl HandlerContext {
    pub(crate) fn new(cancel: CancellationToken, deadline: Instant) -> Self {
        Self { cancel, deadline }
    }

    /// Resolves when the ack timeout elapses or the connection closes.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the ack timeout.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: HandlerContext, event: Event, conn: Connection) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(HandlerContext, Event, Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: HandlerContext, event: Event, conn: Connection) -> HandlerResult {
        (self)(ctx, event, conn).await
    }
}
