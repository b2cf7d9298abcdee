//! Integration tests for the full publish/subscribe pipeline.
//!
//! Tests: Connection → publisher → in-memory backend → subscription → handler
//!
//! Verifies:
//! - Causal links survive a round trip through a handler
//! - Serial subscriptions deliver in order without overlap
//! - Durable consumers resume, reset, and get redeliveries after failures
//! - Fatal conditions take the whole connection down

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::mpsc;

    use eventline_events::{Backend, Data, Envelope, Event, InMemoryServer, StartPosition};

    use crate::config::{ConnectionConfig, SubscriptionConfig};
    use crate::connection::Connection;
    use crate::error::Error;
    use crate::handler::{HandlerContext, HandlerError};

    const WAIT: Duration = Duration::from_secs(5);

    async fn connect(server: &InMemoryServer, client_id: &str) -> Connection {
        eventline_observability::init();
        Connection::connect(server, ConnectionConfig::new(client_id))
            .await
            .unwrap()
    }

    /// Subscription config that sees only what is published after it starts.
    fn fresh() -> SubscriptionConfig {
        SubscriptionConfig::default()
            .with_durable(false)
            .with_start_position(StartPosition::New)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("channel closed")
    }

    /// Handler forwarding every delivery to a channel.
    fn forward(
        tx: mpsc::UnboundedSender<Event>,
    ) -> impl Fn(HandlerContext, Event, Connection) -> futures::future::Ready<Result<(), HandlerError>>
    + Send
    + Sync
    + 'static {
        move |_ctx: HandlerContext, event: Event, _conn: Connection| {
            let _ = tx.send(event);
            futures::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn reaction_carries_cause_of_the_triggering_event() {
        let server = InMemoryServer::new("test-cluster");
        let conn = connect(&server, "ping-pong").await;

        conn.subscribe(
            "tick",
            |_ctx: HandlerContext, event: Event, conn: Connection| async move {
                let mut tock = Event::new("tock").with_data(Data::string("pong"));
                conn.publish_with_cause("tock", &mut tock, event.id()).await?;
                Ok::<(), HandlerError>(())
            },
            fresh().with_serial(true),
        )
        .await
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.subscribe("tock", forward(tx), fresh()).await.unwrap();

        let tick_id = conn
            .emit("tick", "tick", Some(Data::string("ping")))
            .await
            .unwrap();

        let tock = next(&mut rx).await;
        assert_eq!(tock.event_type(), "tock");
        assert_eq!(tock.cause(), Some(tick_id.as_str()));
        assert_eq!(tock.client(), Some("ping-pong"));
        assert_eq!(
            tock.data().unwrap().decode::<String>(conn.registry()).unwrap(),
            "pong"
        );
        let delivery = tock.delivery().unwrap();
        assert_eq!(delivery.stream, "tock");
        assert!(!delivery.redelivered);

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn publisher_owns_the_client_field() {
        let server = InMemoryServer::new("test-cluster");
        let conn = connect(&server, "real-client").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.subscribe("audit", forward(tx), fresh()).await.unwrap();

        let mut event = Event::new("login");
        event.stamp_client("impostor");
        conn.publish("audit", &mut event).await.unwrap();
        assert_eq!(event.client(), Some("real-client"));

        let received = next(&mut rx).await;
        assert_eq!(received.client(), Some("real-client"));

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn serial_subscription_delivers_in_order_without_overlap() {
        let server = InMemoryServer::new("test-cluster");
        let conn = connect(&server, "serial").await;

        let busy = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = {
            let (busy, overlapped) = (busy.clone(), overlapped.clone());
            move |_ctx: HandlerContext, event: Event, conn: Connection| {
                let (busy, overlapped, tx) = (busy.clone(), overlapped.clone(), tx.clone());
                async move {
                    if busy.swap(true, Ordering::SeqCst) {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let n: i64 = event.data().unwrap().decode_json(conn.registry())?;
                    busy.store(false, Ordering::SeqCst);
                    let _ = tx.send(n);
                    Ok::<(), HandlerError>(())
                }
            }
        };
        conn.subscribe("numbers", handler, fresh().with_serial(true))
            .await
            .unwrap();

        for i in 0..10i64 {
            conn.emit("numbers", "number", Some(Data::json(&i).unwrap()))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap());
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert!(!overlapped.load(Ordering::SeqCst));

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn durable_consumer_resumes_after_close_and_replays_after_reset() {
        let server = InMemoryServer::new("test-cluster");
        let conn = connect(&server, "durable-app").await;
        let config = SubscriptionConfig::default().with_consumer_name("ledger");

        for i in 0..3 {
            conn.emit("orders", "order_placed", Some(Data::json(&json!({ "n": i })).unwrap()))
                .await
                .unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = conn
            .subscribe("orders", forward(tx), config.clone())
            .await
            .unwrap();
        for _ in 0..3 {
            next(&mut rx).await;
        }
        // Let the last ack land before closing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        sub.close().await.unwrap();
        assert!(sub.is_closed());
        assert!(server.has_durable("orders", "ledger"));

        let late = conn.emit("orders", "order_placed", None).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = conn
            .subscribe("orders", forward(tx), config.clone())
            .await
            .unwrap();
        let resumed = next(&mut rx).await;
        assert_eq!(resumed.id(), Some(late.as_str()));
        assert_eq!(resumed.delivery().unwrap().sequence, 4);
        tokio::time::sleep(Duration::from_millis(100)).await;
        sub.close().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.subscribe("orders", forward(tx), config.with_reset(true))
            .await
            .unwrap();
        let replayed = next(&mut rx).await;
        assert_eq!(replayed.delivery().unwrap().sequence, 1);

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_handler_gets_a_redelivery_after_ack_timeout() {
        let server = InMemoryServer::new("test-cluster");
        let conn = connect(&server, "flaky").await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = {
            let attempts = attempts.clone();
            move |_ctx: HandlerContext, event: Event, _conn: Connection| {
                let (attempts, tx) = (attempts.clone(), tx.clone());
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(HandlerError::failed(anyhow::anyhow!("downstream unavailable")));
                    }
                    let _ = tx.send(event);
                    Ok::<(), HandlerError>(())
                }
            }
        };
        conn.subscribe(
            "jobs",
            handler,
            SubscriptionConfig::default()
                .with_consumer_name("worker")
                .with_ack_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();

        let id = conn.emit("jobs", "job_queued", None).await.unwrap();

        let event = next(&mut rx).await;
        assert_eq!(event.id(), Some(id.as_str()));
        assert!(event.delivery().unwrap().redelivered);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(!conn.is_closed());

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_payload_encoding_is_a_local_decode_error() {
        let server = InMemoryServer::new("test-cluster");
        let conn = connect(&server, "decoder").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.subscribe(
            "mixed",
            move |_ctx: HandlerContext, event: Event, conn: Connection| {
                let tx = tx.clone();
                async move {
                    let decoded = event
                        .data()
                        .unwrap()
                        .decode_json::<serde_json::Value>(conn.registry());
                    let _ = tx.send(decoded.is_err());
                    Ok::<(), HandlerError>(())
                }
            },
            fresh(),
        )
        .await
        .unwrap();

        let mut event = Event::new("opaque")
            .with_data(Data::from_encoded("application/x-custom", Bytes::from_static(b"\x01\x02"), None));
        conn.publish("mixed", &mut event).await.unwrap();

        let failed = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(failed);
        assert!(!conn.is_closed());

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn undecodable_envelope_closes_the_connection() {
        let server = InMemoryServer::new("test-cluster");
        let conn = connect(&server, "strict").await;

        let (tx, _rx) = mpsc::unbounded_channel();
        conn.subscribe("raw", forward(tx), fresh()).await.unwrap();

        let writer = server.session("raw-writer").unwrap();
        writer
            .publish("raw", Bytes::from_static(b"\xff\xff"))
            .await
            .unwrap();

        let result = tokio::time::timeout(WAIT, conn.wait()).await.unwrap();
        assert!(matches!(result, Err(Error::Fatal { .. })));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn fatal_handler_error_closes_every_subscription() {
        let server = InMemoryServer::new("test-cluster");
        let conn = connect(&server, "fatal").await;

        conn.subscribe(
            "commands",
            |_ctx: HandlerContext, _event: Event, _conn: Connection| async move {
                Err::<(), HandlerError>(HandlerError::fatal(anyhow::anyhow!("invariant broken")))
            },
            fresh(),
        )
        .await
        .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sibling = conn.subscribe("audit", forward(tx), fresh()).await.unwrap();

        conn.emit("commands", "rebuild", None).await.unwrap();

        let result = tokio::time::timeout(WAIT, conn.wait()).await.unwrap();
        match result {
            Err(Error::Fatal { consumer, message }) => {
                assert_eq!(consumer, "fatal");
                assert!(message.contains("invariant broken"));
            }
            other => panic!("expected fatal error, got {other:?}"),
        }
        assert!(sibling.is_closed());
        assert!(matches!(
            conn.emit("audit", "late", None).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn handler_panic_is_treated_as_fatal() {
        let server = InMemoryServer::new("test-cluster");
        let conn = connect(&server, "panicky").await;

        conn.subscribe(
            "alerts",
            |_ctx: HandlerContext, event: Event, _conn: Connection| async move {
                if event.is(&["explode"]) {
                    panic!("handler exploded");
                }
                Ok::<(), HandlerError>(())
            },
            fresh().with_serial(true),
        )
        .await
        .unwrap();

        conn.emit("alerts", "explode", None).await.unwrap();

        let result = tokio::time::timeout(WAIT, conn.wait()).await.unwrap();
        match result {
            Err(Error::Fatal { message, .. }) => assert!(message.contains("handler exploded")),
            other => panic!("expected fatal error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reset_discards_stored_offset_for_a_non_durable_subscription() {
        let server = InMemoryServer::new("test-cluster");
        let conn = connect(&server, "resetter").await;
        let durable = SubscriptionConfig::default().with_consumer_name("ledger");

        for _ in 0..3 {
            conn.emit("orders", "order_placed", None).await.unwrap();
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = conn
            .subscribe("orders", forward(tx), durable.clone())
            .await
            .unwrap();
        for _ in 0..3 {
            next(&mut rx).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        sub.close().await.unwrap();
        assert!(server.has_durable("orders", "ledger"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transient = conn
            .subscribe(
                "orders",
                forward(tx),
                durable.clone().with_durable(false).with_reset(true),
            )
            .await
            .unwrap();
        assert!(!server.has_durable("orders", "ledger"));
        assert_eq!(next(&mut rx).await.delivery().unwrap().sequence, 1);
        transient.close().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.subscribe("orders", forward(tx), durable).await.unwrap();
        assert_eq!(next(&mut rx).await.delivery().unwrap().sequence, 1);

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_forgets_the_durable_offset() {
        let server = InMemoryServer::new("test-cluster");
        let conn = connect(&server, "leaver").await;
        let config = SubscriptionConfig::default().with_consumer_name("archive");

        conn.emit("docs", "doc_saved", None).await.unwrap();
        conn.emit("docs", "doc_saved", None).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = conn
            .subscribe("docs", forward(tx), config.clone())
            .await
            .unwrap();
        next(&mut rx).await;
        next(&mut rx).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        sub.unsubscribe().await.unwrap();
        assert!(sub.is_closed());
        assert!(!server.has_durable("docs", "archive"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.subscribe("docs", forward(tx), config).await.unwrap();
        let replayed = next(&mut rx).await;
        assert_eq!(replayed.delivery().unwrap().sequence, 1);
        assert!(!replayed.delivery().unwrap().redelivered);

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_subscription_overlaps_handlers_and_retries_failures() {
        let server = InMemoryServer::new("test-cluster");
        let conn = connect(&server, "parallel").await;

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let flaky_attempts = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = {
            let (running, peak, flaky_attempts) =
                (running.clone(), peak.clone(), flaky_attempts.clone());
            move |_ctx: HandlerContext, event: Event, _conn: Connection| {
                let (running, peak, flaky_attempts, tx) = (
                    running.clone(),
                    peak.clone(),
                    flaky_attempts.clone(),
                    tx.clone(),
                );
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);

                    if event.is(&["flaky"]) && flaky_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(HandlerError::failed(anyhow::anyhow!("try again")));
                    }
                    let _ = tx.send(event);
                    Ok::<(), HandlerError>(())
                }
            }
        };
        conn.subscribe(
            "work",
            handler,
            fresh()
                .with_serial(false)
                .with_ack_timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap();

        for _ in 0..4 {
            conn.emit("work", "steady", None).await.unwrap();
        }
        let flaky = conn.emit("work", "flaky", None).await.unwrap();

        let mut retried = None;
        for _ in 0..5 {
            let event = next(&mut rx).await;
            if event.is(&["flaky"]) {
                retried = Some(event);
            }
        }
        let retried = retried.unwrap();
        assert_eq!(retried.id(), Some(flaky.as_str()));
        assert!(retried.delivery().unwrap().redelivered);
        assert_eq!(flaky_attempts.load(Ordering::SeqCst), 2);
        assert!(peak.load(Ordering::SeqCst) > 1);
        assert!(!conn.is_closed());

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_subscription_fatal_error_closes_the_connection() {
        let server = InMemoryServer::new("test-cluster");
        let conn = connect(&server, "parallel-fatal").await;

        conn.subscribe(
            "work",
            |_ctx: HandlerContext, event: Event, _conn: Connection| async move {
                if event.is(&["poison"]) {
                    return Err(HandlerError::fatal(anyhow::anyhow!("poisoned input")));
                }
                Ok::<(), HandlerError>(())
            },
            fresh().with_serial(false),
        )
        .await
        .unwrap();

        conn.emit("work", "fine", None).await.unwrap();
        conn.emit("work", "poison", None).await.unwrap();

        let result = tokio::time::timeout(WAIT, conn.wait()).await.unwrap();
        match result {
            Err(Error::Fatal { message, .. }) => assert!(message.contains("poisoned input")),
            other => panic!("expected fatal error, got {other:?}"),
        }
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn concurrent_subscription_panic_closes_the_connection() {
        let server = InMemoryServer::new("test-cluster");
        let conn = connect(&server, "parallel-panic").await;

        conn.subscribe(
            "work",
            |_ctx: HandlerContext, event: Event, _conn: Connection| async move {
                if event.is(&["explode"]) {
                    panic!("worker exploded");
                }
                Ok::<(), HandlerError>(())
            },
            fresh().with_serial(false),
        )
        .await
        .unwrap();

        conn.emit("work", "explode", None).await.unwrap();

        let result = tokio::time::timeout(WAIT, conn.wait()).await.unwrap();
        match result {
            Err(Error::Fatal { message, .. }) => assert!(message.contains("worker exploded")),
            other => panic!("expected fatal error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_connection_rejects_work_and_frees_the_client_id() {
        let server = InMemoryServer::new("test-cluster");
        let conn = connect(&server, "one-shot").await;

        let duplicate = Connection::connect(&server, ConnectionConfig::new("one-shot")).await;
        assert!(matches!(duplicate, Err(Error::Backend(_))));

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(!server.is_connected("one-shot"));

        assert!(matches!(
            conn.emit("anything", "late", None).await,
            Err(Error::Closed)
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            conn.subscribe("anything", forward(tx), fresh()).await,
            Err(Error::Closed)
        ));
        assert!(conn.wait().await.is_ok());

        let again = connect(&server, "one-shot").await;
        again.close().await.unwrap();
    }

    #[tokio::test]
    async fn connect_rejects_bad_configuration() {
        let server = InMemoryServer::new("test-cluster");

        let empty = Connection::connect(&server, ConnectionConfig::new("")).await;
        assert!(matches!(empty, Err(Error::InvalidConfig(_))));

        let wrong_cluster = Connection::connect(
            &server,
            ConnectionConfig::new("lost").with_cluster("other-cluster"),
        )
        .await;
        assert!(matches!(wrong_cluster, Err(Error::Backend(_))));
    }
}
