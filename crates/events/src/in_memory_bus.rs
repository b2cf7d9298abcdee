//! In-memory stream engine for tests/dev.
//!
//! - Append-only log per stream, sequences start at 1
//! - Durable consumers keyed by `(stream, durable name)`; subscribing to a
//!   live durable joins it as another queue group member, and the members
//!   split deliveries between them
//! - Ack-wait redelivery and an in-flight cap per consumer
//! - One session per client id, all sessions in one cluster
//!
//! State lives behind a single mutex; delivery runs in one Tokio task per
//! subscription, woken on publish, on ack, and when the earliest ack deadline
//! passes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, mpsc};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bus::{
    Acker, Backend, BackendError, BackendSubscription, ConnectionStatus, Connector, RawMessage,
    StartPosition, SubscribeRequest, SubscriptionHandle,
};

const CHANNEL_CAPACITY: usize = 64;

/// In-memory stand-in for a streaming server.
#[derive(Debug, Clone)]
pub struct InMemoryServer {
    inner: Arc<ServerInner>,
}

#[derive(Debug)]
struct ServerInner {
    cluster: String,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, Vec<Entry>>,
    consumers: HashMap<u64, Consumer>,
    durables: HashMap<(String, String), u64>,
    clients: HashMap<String, ConnectionStatus>,
    next_key: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct Consumer {
    stream: String,
    /// Every sequence below `floor` is acknowledged.
    floor: u64,
    /// Acknowledged sequences at or above `floor`.
    acked: BTreeSet<u64>,
    /// Next sequence to hand out.
    cursor: u64,
    /// Highest sequence ever handed out.
    delivered: u64,
    /// Outstanding deliveries and their redelivery deadlines.
    inflight: BTreeMap<u64, Instant>,
    ack_wait: Duration,
    max_inflight: usize,
    /// Bumped on every (re)activation so stale handles and ackers are ignored.
    generation: u64,
    /// Open subscriptions sharing this consumer as one queue group.
    members: usize,
    wake: Arc<Notify>,
}

impl Consumer {
    fn ack(&mut self, sequence: u64) {
        if sequence < self.floor {
            return;
        }
        self.inflight.remove(&sequence);
        self.acked.insert(sequence);
        while self.acked.remove(&self.floor) {
            self.floor += 1;
        }
    }

    fn active(&self) -> bool {
        self.members > 0
    }

    /// One member left. Once the last one is gone, outstanding deliveries are
    /// forgotten and handed out again on the next activation.
    fn leave(&mut self) {
        self.members = self.members.saturating_sub(1);
        if self.members == 0 {
            self.inflight.clear();
            self.cursor = self.floor;
        }
    }
}

struct Batch {
    ready: Vec<(u64, Entry, bool)>,
    next_deadline: Option<Instant>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryServer {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                cluster: cluster.into(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.inner.cluster
    }

    /// Number of messages stored on `stream`.
    pub fn stream_len(&self, stream: &str) -> usize {
        lock(&self.inner.state)
            .streams
            .get(stream)
            .map_or(0, Vec::len)
    }

    /// True while a position is stored for this durable consumer.
    pub fn has_durable(&self, stream: &str, durable: &str) -> bool {
        lock(&self.inner.state)
            .durables
            .contains_key(&(stream.to_string(), durable.to_string()))
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        lock(&self.inner.state).clients.contains_key(client_id)
    }

    /// Override the status reported to a client's session.
    pub fn set_status(&self, client_id: &str, status: ConnectionStatus) {
        if let Some(s) = lock(&self.inner.state).clients.get_mut(client_id) {
            *s = status;
        }
    }

    /// Open a session directly, without going through [`Connector`].
    pub fn session(&self, client_id: &str) -> Result<InMemorySession, BackendError> {
        if client_id.is_empty() {
            return Err(BackendError::Connect("client id required".into()));
        }
        let mut state = lock(&self.inner.state);
        if state.clients.contains_key(client_id) {
            return Err(BackendError::Connect(format!(
                "client id {client_id} already registered"
            )));
        }
        state
            .clients
            .insert(client_id.to_string(), ConnectionStatus::Connected);

        Ok(InMemorySession {
            inner: self.inner.clone(),
            client_id: client_id.to_string(),
            subscriptions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Connector for InMemoryServer {
    async fn connect(
        &self,
        address: &str,
        cluster: &str,
        client_id: &str,
    ) -> Result<Arc<dyn Backend>, BackendError> {
        if cluster != self.inner.cluster {
            return Err(BackendError::Connect(format!(
                "unknown cluster {cluster}, server runs {}",
                self.inner.cluster
            )));
        }
        debug!(address, cluster, client_id, "in-memory session opened");
        Ok(Arc::new(self.session(client_id)?))
    }
}

impl ServerInner {
    /// Collect what the consumer may receive now. `None` once the consumer is
    /// gone or belongs to a newer generation.
    fn poll(&self, key: u64, generation: u64) -> Option<Batch> {
        let mut state = lock(&self.state);
        let State {
            streams, consumers, ..
        } = &mut *state;

        let consumer = consumers.get_mut(&key)?;
        if !consumer.active() || consumer.generation != generation {
            return None;
        }
        let log = streams.get(&consumer.stream).map(Vec::as_slice).unwrap_or_default();
        let now = Instant::now();
        let mut ready = Vec::new();

        let expired: Vec<u64> = consumer
            .inflight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            consumer.inflight.insert(seq, now + consumer.ack_wait);
            if let Some(entry) = log.get(seq as usize - 1) {
                ready.push((seq, entry.clone(), true));
            }
        }

        while consumer.inflight.len() < consumer.max_inflight
            && (consumer.cursor as usize) <= log.len()
        {
            let seq = consumer.cursor;
            consumer.cursor += 1;
            if seq < consumer.floor || consumer.acked.contains(&seq) {
                continue;
            }
            let redelivered = seq <= consumer.delivered;
            consumer.delivered = consumer.delivered.max(seq);
            consumer.inflight.insert(seq, now + consumer.ack_wait);
            ready.push((seq, log[seq as usize - 1].clone(), redelivered));
        }

        Some(Batch {
            ready,
            next_deadline: consumer.inflight.values().min().copied(),
        })
    }
}

/// A client session on an [`InMemoryServer`].
#[derive(Debug)]
pub struct InMemorySession {
    inner: Arc<ServerInner>,
    client_id: String,
    subscriptions: Mutex<Vec<Arc<SubscriptionControl>>>,
    closed: AtomicBool,
}

impl InMemorySession {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Backend for InMemorySession {
    async fn publish(&self, stream: &str, payload: Bytes) -> Result<(), BackendError> {
        self.ensure_open()?;
        let mut state = lock(&self.inner.state);
        state.streams.entry(stream.to_string()).or_default().push(Entry {
            data: payload,
            timestamp: Utc::now(),
        });
        for consumer in state.consumers.values() {
            if consumer.active() && consumer.stream == stream {
                consumer.wake.notify_one();
            }
        }
        Ok(())
    }

    async fn queue_subscribe(
        &self,
        stream: &str,
        request: SubscribeRequest,
    ) -> Result<BackendSubscription, BackendError> {
        self.ensure_open()?;
        if request.max_inflight == 0 {
            return Err(BackendError::subscribe(stream, "max in-flight must be positive"));
        }
        if request.ack_wait.is_zero() {
            return Err(BackendError::subscribe(stream, "ack wait must be positive"));
        }

        let (key, generation, wake) = {
            let mut state = lock(&self.inner.state);
            let durable_key = request
                .durable
                .as_ref()
                .map(|d| (stream.to_string(), d.clone()));
            let existing = durable_key
                .as_ref()
                .and_then(|k| state.durables.get(k).copied());

            match existing.and_then(|k| state.consumers.get_mut(&k).map(|c| (k, c))) {
                // A live durable gains another queue group member; the
                // first member's ack wait and in-flight cap stay in force.
                Some((key, consumer)) if consumer.active() => {
                    consumer.members += 1;
                    (key, consumer.generation, consumer.wake.clone())
                }
                Some((key, consumer)) => {
                    let wake = Arc::new(Notify::new());
                    consumer.members = 1;
                    consumer.generation += 1;
                    consumer.ack_wait = request.ack_wait;
                    consumer.max_inflight = request.max_inflight;
                    consumer.wake = wake.clone();
                    (key, consumer.generation, wake)
                }
                None => {
                    let wake = Arc::new(Notify::new());
                    let start = match request.start {
                        StartPosition::First => 1,
                        StartPosition::New => {
                            state.streams.get(stream).map_or(0, Vec::len) as u64 + 1
                        }
                    };
                    state.next_key += 1;
                    let key = state.next_key;
                    state.consumers.insert(
                        key,
                        Consumer {
                            stream: stream.to_string(),
                            floor: start,
                            acked: BTreeSet::new(),
                            cursor: start,
                            delivered: start - 1,
                            inflight: BTreeMap::new(),
                            ack_wait: request.ack_wait,
                            max_inflight: request.max_inflight,
                            generation: 0,
                            members: 1,
                            wake: wake.clone(),
                        },
                    );
                    if let Some(k) = durable_key {
                        state.durables.insert(k, key);
                    }
                    (key, 0, wake)
                }
            }
        };

        let control = Arc::new(SubscriptionControl {
            inner: self.inner.clone(),
            stream: stream.to_string(),
            durable: request.durable.clone(),
            key,
            generation,
            cancel: CancellationToken::new(),
        });
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.retain(|c| !c.cancel.is_cancelled());
            subs.push(control.clone());
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(deliver(control.clone(), wake, tx));

        debug!(
            stream,
            group = %request.group,
            durable = ?request.durable,
            "in-memory subscription opened"
        );
        Ok(BackendSubscription {
            handle: Box::new(MemoryHandle { control }),
            messages: rx,
        })
    }

    fn status(&self) -> ConnectionStatus {
        if self.closed.load(Ordering::SeqCst) {
            return ConnectionStatus::Closed;
        }
        lock(&self.inner.state)
            .clients
            .get(&self.client_id)
            .copied()
            .unwrap_or(ConnectionStatus::Closed)
    }

    async fn close(&self) -> Result<(), BackendError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let subs = match self.subscriptions.lock() {
            Ok(mut subs) => std::mem::take(&mut *subs),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for sub in subs {
            sub.close();
        }
        lock(&self.inner.state).clients.remove(&self.client_id);
        Ok(())
    }
}

#[derive(Debug)]
struct SubscriptionControl {
    inner: Arc<ServerInner>,
    stream: String,
    durable: Option<String>,
    key: u64,
    generation: u64,
    cancel: CancellationToken,
}

impl SubscriptionControl {
    fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let mut state = lock(&self.inner.state);
        let current = state
            .consumers
            .get(&self.key)
            .is_some_and(|c| c.generation == self.generation && c.active());
        if !current {
            return;
        }
        if self.durable.is_some() {
            if let Some(c) = state.consumers.get_mut(&self.key) {
                c.leave();
            }
        } else {
            state.consumers.remove(&self.key);
        }
    }

    /// Drop the consumer and its durable offset for every member of the group.
    fn unsubscribe(&self) {
        self.cancel.cancel();
        let mut state = lock(&self.inner.state);
        let owned = state
            .consumers
            .get(&self.key)
            .is_some_and(|c| c.generation == self.generation);
        if !owned {
            return;
        }
        state.consumers.remove(&self.key);
        if let Some(durable) = &self.durable {
            state
                .durables
                .remove(&(self.stream.clone(), durable.clone()));
        }
    }
}

struct MemoryHandle {
    control: Arc<SubscriptionControl>,
}

#[async_trait]
impl SubscriptionHandle for MemoryHandle {
    async fn close(&self) -> Result<(), BackendError> {
        self.control.close();
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), BackendError> {
        self.control.unsubscribe();
        Ok(())
    }
}

struct MemoryAcker {
    inner: Arc<ServerInner>,
    key: u64,
    generation: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self, sequence: u64) -> Result<(), BackendError> {
        let mut state = lock(&self.inner.state);
        match state.consumers.get_mut(&self.key) {
            Some(c) if c.active() && c.generation == self.generation => {
                c.ack(sequence);
                c.wake.notify_one();
                Ok(())
            }
            _ => Err(BackendError::Ack("subscription closed".into())),
        }
    }
}

async fn deliver(
    control: Arc<SubscriptionControl>,
    wake: Arc<Notify>,
    tx: mpsc::Sender<RawMessage>,
) {
    let acker: Arc<dyn Acker> = Arc::new(MemoryAcker {
        inner: control.inner.clone(),
        key: control.key,
        generation: control.generation,
    });

    loop {
        let Some(batch) = control.inner.poll(control.key, control.generation) else {
            return;
        };
        let sent_any = !batch.ready.is_empty();

        for (seq, entry, redelivered) in batch.ready {
            let msg = RawMessage::new(
                entry.data,
                seq,
                entry.timestamp,
                control.stream.clone(),
                redelivered,
                acker.clone(),
            );
            tokio::select! {
                sent = tx.send(msg) => if sent.is_err() { return },
                _ = control.cancel.cancelled() => return,
            }
        }
        if sent_any {
            continue;
        }

        let deadline = batch.next_deadline;
        tokio::select! {
            _ = control.cancel.cancelled() => return,
            _ = wake.notified() => {}
            _ = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
    }
}
