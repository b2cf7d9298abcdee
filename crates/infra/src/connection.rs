//! One backend session and everything opened through it.
//!
//! A `Connection` is a cheap handle (`Arc` inside); clones share the session,
//! the codec registry and the set of live subscriptions. Handlers receive a
//! clone so they can publish follow-up events.
//!
//! Lifecycle:
//! - [`connect`](Connection::connect) opens the session and starts the status
//!   monitor.
//! - [`close`](Connection::close) closes every subscription (durable offsets
//!   are kept), then the session. Idempotent.
//! - A fatal subscription error closes the connection the same way and is
//!   reported by [`wait`](Connection::wait).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use eventline_codec::CodecRegistry;
use eventline_events::{Backend, ConnectionStatus, Connector};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::monitor;
use crate::publisher::Publisher;
use crate::subscription::SubscriptionShared;

#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    backend: Arc<dyn Backend>,
    registry: Arc<CodecRegistry>,
    publisher: Publisher,
    subscriptions: Mutex<Vec<Arc<SubscriptionShared>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    fatal: Mutex<Option<Error>>,
    status: watch::Sender<ConnectionStatus>,
}

impl Connection {
    /// Connect with the standard codec registry.
    pub async fn connect(connector: &dyn Connector, config: ConnectionConfig) -> Result<Self> {
        Self::connect_with_registry(connector, config, Arc::new(CodecRegistry::standard())).await
    }

    #[instrument(
        skip(connector, config, registry),
        fields(client = %config.client_id, cluster = %config.cluster, address = %config.address),
        err
    )]
    pub async fn connect_with_registry(
        connector: &dyn Connector,
        config: ConnectionConfig,
        registry: Arc<CodecRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let backend = connector
            .connect(&config.address, &config.cluster, &config.client_id)
            .await?;
        info!("connected");
        Ok(Self::from_backend(backend, config, registry))
    }

    /// Wrap an already-open backend session. Must be called inside a Tokio
    /// runtime; the status monitor is spawned here.
    pub fn from_backend(
        backend: Arc<dyn Backend>,
        config: ConnectionConfig,
        registry: Arc<CodecRegistry>,
    ) -> Self {
        let (status, _) = watch::channel(backend.status());
        let publisher = Publisher::new(config.client_id.clone(), backend.clone(), registry.clone());
        let conn = Self {
            inner: Arc::new(Inner {
                config,
                backend,
                registry,
                publisher,
                subscriptions: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                fatal: Mutex::new(None),
                status,
            }),
        };

        monitor::spawn(
            conn.inner.config.client_id.clone(),
            conn.inner.backend.clone(),
            conn.inner.config.monitor_interval,
            conn.inner.status.clone(),
            conn.inner.shutdown.clone(),
        );
        conn
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.inner.registry
    }

    /// Current backend status, read directly from the session.
    pub fn status(&self) -> ConnectionStatus {
        if self.is_closed() {
            return ConnectionStatus::Closed;
        }
        self.inner.backend.status()
    }

    /// Status as last observed by the monitor; changes on every transition.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The error that brought the connection down, if any.
    pub fn fatal_error(&self) -> Option<Error> {
        self.inner
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Close every subscription, then the backend session.
    ///
    /// Durable offsets survive. Safe to call more than once; later calls
    /// are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.cancel();

        let subs = std::mem::take(
            &mut *self
                .inner
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        let mut first_err = None;
        for sub in subs {
            if let Err(e) = sub.close().await {
                warn!(consumer = %sub.consumer(), stream = %sub.stream(), error = %e, "subscription close failed");
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.inner.backend.close().await {
            warn!(client = %self.client_id(), error = %e, "backend close failed");
            first_err.get_or_insert(e.into());
        }
        self.inner.status.send_replace(ConnectionStatus::Closed);
        info!(client = %self.client_id(), "connection closed");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Block until the process is interrupted (then close), the connection is
    /// closed, or a subscription fails fatally. Returns the fatal error if
    /// that is what ended it.
    pub async fn wait(&self) -> Result<()> {
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => {}
            _ = interrupted() => {
                info!(client = %self.client_id(), "interrupt received, closing");
                self.close().await?;
            }
        }
        match self.fatal_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Record a fatal error and tear the connection down.
    pub(crate) async fn fail(&self, err: Error) {
        error!(client = %self.client_id(), error = %err, "fatal error, closing connection");
        self.inner
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(err);
        if let Err(e) = self.close().await {
            warn!(client = %self.client_id(), error = %e, "close after fatal error failed");
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub(crate) fn publisher(&self) -> &Publisher {
        &self.inner.publisher
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Track a subscription for bulk close. Fails if the connection closed in
    /// the meantime; the caller then closes the subscription itself.
    pub(crate) fn track(&self, sub: Arc<SubscriptionShared>) -> Result<()> {
        let mut subs = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return Err(Error::Closed);
        }
        subs.retain(|s| !s.is_closed());
        subs.push(sub);
        Ok(())
    }
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id())
            .field("cluster", &self.inner.config.cluster)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Resolves on Ctrl-C. Never resolves if the signal handler cannot be
/// installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for interrupt");
        std::future::pending::<()>().await;
    }
}
