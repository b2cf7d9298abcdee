//! Subscription controller: binds a handler to a stream and drives delivery.
//!
//! Per delivery:
//!
//! ```text
//! received → decoded → handler invoked ─┬─ Ok      → ack
//!                                       ├─ Failed  → no ack (backend redelivers after ack timeout)
//!                                       └─ Fatal / panic → connection closed
//! ```
//!
//! A delivery that cannot be decoded as an envelope is fatal as well: skipping
//! it would silently break ordering for everything downstream.
//!
//! With `serial` the backend is asked for an in-flight cap of one and the
//! handler runs inline in the dispatch task, so invocations never overlap and
//! follow stream order. Otherwise each delivery gets its own task and handlers
//! must synchronize shared state themselves.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use eventline_events::{
    Delivery, Envelope, Event, RawMessage, SubscribeRequest, SubscriptionHandle,
};

use crate::config::SubscriptionConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::handler::{Handler, HandlerContext, HandlerError};

/// State shared between a [`Subscription`], its dispatch task, and the
/// connection that tracks it.
pub(crate) struct SubscriptionShared {
    stream: String,
    consumer: String,
    handle: Box<dyn SubscriptionHandle>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl SubscriptionShared {
    pub(crate) fn stream(&self) -> &str {
        &self.stream
    }

    pub(crate) fn consumer(&self) -> &str {
        &self.consumer
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        self.handle.close().await?;
        debug!(consumer = %self.consumer, stream = %self.stream, "subscription closed");
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.handle.unsubscribe().await?;
        debug!(consumer = %self.consumer, stream = %self.stream, "subscription removed");
        Ok(())
    }
}

/// A handler bound to a stream.
///
/// Dropping a `Subscription` does not stop it; it runs until closed here or
/// until the connection closes.
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    pub fn stream(&self) -> &str {
        self.shared.stream()
    }

    pub fn consumer(&self) -> &str {
        self.shared.consumer()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stop delivery. A durable consumer's offset is kept, so subscribing
    /// again under the same name resumes after the last acknowledgment.
    pub async fn close(&self) -> Result<()> {
        self.shared.close().await
    }

    /// Stop delivery and discard the durable offset; the next subscription
    /// under this name starts from its start position.
    pub async fn unsubscribe(&self) -> Result<()> {
        self.shared.unsubscribe().await
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("stream", &self.stream())
            .field("consumer", &self.consumer())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Bind `handler` to `stream`.
    ///
    /// The consumer name defaults to this connection's client id. With
    /// `reset`, any stored offset under the consumer name is discarded first,
    /// whether or not this subscription is itself durable.
    #[instrument(skip(self, handler, config), fields(client = %self.client_id()), err)]
    pub async fn subscribe<H>(
        &self,
        stream: &str,
        handler: H,
        config: SubscriptionConfig,
    ) -> Result<Subscription>
    where
        H: Handler,
    {
        self.ensure_open()?;
        config.validate()?;

        let consumer = config
            .consumer_name
            .clone()
            .unwrap_or_else(|| self.client_id().to_string());
        let request = SubscribeRequest {
            group: consumer.clone(),
            durable: config.durable.then(|| consumer.clone()),
            start: config.start_position,
            ack_wait: config.ack_timeout,
            max_inflight: config.max_inflight(),
        };

        if config.reset {
            let stored = SubscribeRequest {
                durable: Some(consumer.clone()),
                ..request.clone()
            };
            reset_durable(self, stream, stored).await?;
        }

        let sub = self.backend().queue_subscribe(stream, request).await?;
        let shared = Arc::new(SubscriptionShared {
            stream: stream.to_string(),
            consumer: consumer.clone(),
            handle: sub.handle,
            cancel: self.shutdown_token().child_token(),
            closed: AtomicBool::new(false),
        });
        if let Err(e) = self.track(shared.clone()) {
            shared.close().await?;
            return Err(e);
        }

        let dispatcher = Dispatcher {
            shared: shared.clone(),
            handler: Arc::new(handler),
            conn: self.clone(),
            ack_timeout: config.ack_timeout,
        };
        tokio::spawn(dispatcher.run(sub.messages, config.serial));

        info!(
            consumer = %consumer,
            stream,
            durable = config.durable,
            serial = config.serial,
            "subscribed"
        );
        Ok(Subscription { shared })
    }
}

/// Discard a durable offset by opening the durable and unsubscribing it
/// straight away.
async fn reset_durable(conn: &Connection, stream: &str, request: SubscribeRequest) -> Result<()> {
    let durable = request.durable.clone().unwrap_or_default();
    let transient = conn.backend().queue_subscribe(stream, request).await?;
    transient.handle.unsubscribe().await?;
    debug!(stream, durable = %durable, "durable offset reset");
    Ok(())
}

struct Dispatcher<H> {
    shared: Arc<SubscriptionShared>,
    handler: Arc<H>,
    conn: Connection,
    ack_timeout: Duration,
}

impl<H: Handler> Dispatcher<H> {
    async fn run(self, mut messages: mpsc::Receiver<RawMessage>, serial: bool) {
        let this = Arc::new(self);
        let mut running: JoinSet<Result<()>> = JoinSet::new();

        let fatal = loop {
            tokio::select! {
                _ = this.shared.cancel.cancelled() => break None,
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => break Some(e),
                        Err(e) if e.is_panic() => {
                            break Some(Error::fatal(&this.shared.consumer, panic_message(e.into_panic())))
                        }
                        Err(_) => {}
                    }
                }
                msg = messages.recv() => {
                    let Some(msg) = msg else { break None };
                    if serial {
                        if let Err(e) = this.deliver(msg).await {
                            break Some(e);
                        }
                    } else {
                        let this = this.clone();
                        running.spawn(async move { this.deliver(msg).await });
                    }
                }
            }
        };

        // Handlers already running finish on their own; their acks fail once
        // the subscription is closed.
        running.detach_all();

        match fatal {
            Some(err) => this.conn.fail(err).await,
            None => debug!(consumer = %this.shared.consumer, stream = %this.shared.stream, "dispatch stopped"),
        }
    }

    /// Run one delivery to completion. `Err` only for conditions that must
    /// take the connection down.
    async fn deliver(&self, msg: RawMessage) -> Result<()> {
        let consumer = &self.shared.consumer;
        let mut event = match Event::unmarshal(&msg.data) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    consumer = %consumer,
                    stream = %msg.subject,
                    sequence = msg.sequence,
                    error = %e,
                    "undecodable envelope"
                );
                return Err(Error::fatal(
                    consumer,
                    format!("undecodable envelope at {} #{}: {e}", msg.subject, msg.sequence),
                ));
            }
        };
        event.set_delivery(Delivery {
            stream: msg.subject.clone(),
            sequence: msg.sequence,
            timestamp: msg.timestamp,
            redelivered: msg.redelivered,
        });
        let event_id = event.id().unwrap_or_default().to_string();
        let event_type = event.event_type().to_string();

        let deadline = Instant::now() + self.ack_timeout;
        let token = self.shared.cancel.child_token();
        let ctx = HandlerContext::new(token.clone(), deadline);

        let invocation = AssertUnwindSafe(self.handler.handle(ctx, event, self.conn.clone()))
            .catch_unwind();
        tokio::pin!(invocation);
        let outcome = tokio::select! {
            biased;
            out = &mut invocation => out,
            _ = tokio::time::sleep_until(deadline) => {
                token.cancel();
                invocation.await
            }
        };
        token.cancel();

        match outcome {
            Ok(Ok(())) => {
                match msg.ack().await {
                    Ok(()) => debug!(consumer = %consumer, event_id = %event_id, "acked"),
                    Err(e) => warn!(
                        consumer = %consumer,
                        event_id = %event_id,
                        error = %e,
                        "ack failed, delivery will be retried"
                    ),
                }
                Ok(())
            }
            Ok(Err(HandlerError::Failed(e))) => {
                warn!(
                    consumer = %consumer,
                    event_id = %event_id,
                    event_type = %event_type,
                    error = %e,
                    "handler failed, delivery will be retried"
                );
                Ok(())
            }
            Ok(Err(HandlerError::Fatal(e))) => {
                error!(consumer = %consumer, event_id = %event_id, error = %e, "handler fatal error");
                Err(Error::fatal(consumer, e))
            }
            Err(panic) => {
                let message = panic_message(panic);
                error!(consumer = %consumer, event_id = %event_id, panic = %message, "handler panicked");
                Err(Error::fatal(consumer, format!("handler panicked: {message}")))
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
