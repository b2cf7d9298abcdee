//! Connectivity monitor.
//!
//! Polls the backend status on an interval, logs transitions and publishes
//! them on a watch channel. Reconnecting is the backend's job; this task only
//! observes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use eventline_events::{Backend, ConnectionStatus};

pub(crate) fn spawn(
    client: String,
    backend: Arc<dyn Backend>,
    every: Duration,
    status: watch::Sender<ConnectionStatus>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let current = backend.status();
            let previous = *status.borrow();
            if current != previous {
                log_transition(&client, previous, current);
                status.send_replace(current);
            }
        }
    })
}

fn log_transition(client: &str, previous: ConnectionStatus, current: ConnectionStatus) {
    match current {
        ConnectionStatus::Connected => {
            info!(client, from = %previous, "reconnected")
        }
        ConnectionStatus::Disconnected => warn!(client, "disconnected"),
        ConnectionStatus::Reconnecting => warn!(client, "reconnecting"),
        ConnectionStatus::Connecting => info!(client, "connecting"),
        ConnectionStatus::Closed => info!(client, "backend closed"),
    }
}

#[cfg(test)]
mod tests {
    use eventline_events::InMemoryServer;

    use super::*;

    #[tokio::test]
    async fn transitions_are_published_until_shutdown() {
        let server = InMemoryServer::new("test-cluster");
        let backend: Arc<dyn Backend> = Arc::new(server.session("watched").unwrap());
        let (tx, mut rx) = watch::channel(ConnectionStatus::Connected);
        let shutdown = CancellationToken::new();
        let task = spawn(
            "watched".into(),
            backend,
            Duration::from_millis(10),
            tx,
            shutdown.clone(),
        );

        server.set_status("watched", ConnectionStatus::Reconnecting);
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionStatus::Reconnecting);

        server.set_status("watched", ConnectionStatus::Connected);
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionStatus::Connected);

        shutdown.cancel();
        task.await.unwrap();
    }
}
