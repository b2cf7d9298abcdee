//! Redis Streams-backed stream engine (durable, at-least-once delivery).
//!
//! Mapping onto Redis:
//! - **Stream key**: `{prefix}:{cluster}:{stream}`, one Redis stream per
//!   named stream
//! - **Publish**: `XADD key * payload <envelope bytes>`
//! - **Durable consumer**: a consumer group named after the durable; the
//!   group's last-delivered id is the stored offset
//! - **Non-durable consumer**: a throwaway group destroyed on close
//! - **Start position**: the group's creation id, `0` (first) or `$` (new)
//! - **Ack**: `XACK`
//! - **Ack timeout**: entries pending longer than the ack wait are taken back
//!   with `XPENDING` + `XCLAIM` and delivered again, flagged `redelivered`
//! - **Unsubscribe**: `XGROUP DESTROY`
//!
//! Sequences handed to subscribers number deliveries per subscription in
//! first-seen order; Redis entry ids are kept internally for acks.
//!
//! The `redis` client used here is synchronous; every call runs on the
//! blocking pool.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use eventline_core::next_id;
use eventline_events::{
    Acker, Backend, BackendError, BackendSubscription, ConnectionStatus, Connector, RawMessage,
    StartPosition, SubscribeRequest, SubscriptionHandle,
};

/// Default prefix of every stream key.
const DEFAULT_KEY_PREFIX: &str = "eventline";

/// Field holding the envelope bytes in each stream entry.
const PAYLOAD_FIELD: &str = "payload";

/// How long one `XREADGROUP` blocks waiting for new entries.
const BLOCK_MS: u64 = 100;

/// Pause between polls when the in-flight cap is reached or Redis errored.
const IDLE_PAUSE: Duration = Duration::from_millis(50);
const ERROR_PAUSE: Duration = Duration::from_millis(500);

const CHANNEL_CAPACITY: usize = 64;

/// Opens [`RedisStreamsSession`]s. The address is a Redis URL
/// (e.g. `redis://localhost:6379`).
#[derive(Debug, Clone)]
pub struct RedisStreamsConnector {
    key_prefix: String,
}

impl Default for RedisStreamsConnector {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl RedisStreamsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

#[async_trait]
impl Connector for RedisStreamsConnector {
    #[instrument(skip(self), err)]
    async fn connect(
        &self,
        address: &str,
        cluster: &str,
        client_id: &str,
    ) -> Result<Arc<dyn Backend>, BackendError> {
        if client_id.is_empty() {
            return Err(BackendError::Connect("client id required".into()));
        }
        let client = redis::Client::open(address)
            .map_err(|e| BackendError::Connect(e.to_string()))?;
        let client = Arc::new(client);

        let probe = client.clone();
        blocking(move || {
            let mut conn = probe.get_connection()?;
            redis::cmd("PING").query::<String>(&mut conn)
        })
        .await
        .map_err(|e| BackendError::Connect(e.to_string()))?;

        Ok(Arc::new(RedisStreamsSession {
            client,
            key_prefix: format!("{}:{}", self.key_prefix, cluster),
            client_id: client_id.to_string(),
            status: Arc::new(Mutex::new(ConnectionStatus::Connected)),
            closed: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        }))
    }
}

/// A client session against one Redis server.
#[derive(Debug)]
pub struct RedisStreamsSession {
    client: Arc<redis::Client>,
    key_prefix: String,
    client_id: String,
    status: Arc<Mutex<ConnectionStatus>>,
    closed: AtomicBool,
    subscriptions: Mutex<Vec<Arc<GroupReader>>>,
}

impl RedisStreamsSession {
    fn stream_key(&self, stream: &str) -> String {
        format!("{}:{}", self.key_prefix, stream)
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
impl Backend for RedisStreamsSession {
    #[instrument(skip(self, payload), fields(client = %self.client_id, bytes = payload.len()), err)]
    async fn publish(&self, stream: &str, payload: Bytes) -> Result<(), BackendError> {
        self.ensure_open()?;
        let client = self.client.clone();
        let key = self.stream_key(stream);

        let result = blocking(move || {
            let mut conn = client.get_connection()?;
            redis::cmd("XADD")
                .arg(&key)
                .arg("*")
                .arg(PAYLOAD_FIELD)
                .arg(payload.to_vec())
                .query::<String>(&mut conn)
        })
        .await;
        track(&self.status, &result);
        result.map(|_| ()).map_err(|e| BackendError::publish(stream, e))
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

        let group = match &request.durable {
            Some(durable) => durable.clone(),
            None => format!("{}.{}", request.group, next_id()),
        };
        let reader = Arc::new(GroupReader {
            client: self.client.clone(),
            stream: stream.to_string(),
            key: self.stream_key(stream),
            group,
            consumer: self.client_id.clone(),
            durable: request.durable.is_some(),
            ack_wait: request.ack_wait,
            max_inflight: request.max_inflight,
            cancel: CancellationToken::new(),
            state: Mutex::new(ReaderState::default()),
            status: self.status.clone(),
        });

        let start = match request.start {
            StartPosition::First => "0",
            StartPosition::New => "$",
        };
        reader
            .create_group(start)
            .await
            .map_err(|e| BackendError::subscribe(stream, e))?;

        if let Ok(mut subs) = self.subscriptions.lock() {
            register(&mut subs, reader.clone());
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(read_loop(reader.clone(), tx));

        debug!(stream, group = %reader.group, durable = reader.durable, "redis subscription opened");
        Ok(BackendSubscription {
            handle: Box::new(RedisHandle { reader }),
            messages: rx,
        })
    }

    fn status(&self) -> ConnectionStatus {
        if self.closed.load(Ordering::SeqCst) {
            return ConnectionStatus::Closed;
        }
        *lock(&self.status)
    }

    async fn close(&self) -> Result<(), BackendError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let subs = match self.subscriptions.lock() {
            Ok(mut subs) => std::mem::take(&mut *subs),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let mut first_err = None;
        for reader in subs {
            if let Err(e) = reader.close().await {
                first_err.get_or_insert(e);
            }
        }
        *lock(&self.status) = ConnectionStatus::Closed;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct ReaderState {
    /// Entry ids delivered and not acknowledged yet.
    inflight: HashSet<String>,
    seq_of: HashMap<String, u64>,
    id_of: HashMap<u64, String>,
    next_seq: u64,
}

impl ReaderState {
    fn sequence(&mut self, id: &str) -> u64 {
        if let Some(seq) = self.seq_of.get(id) {
            return *seq;
        }
        self.next_seq += 1;
        self.seq_of.insert(id.to_string(), self.next_seq);
        self.id_of.insert(self.next_seq, id.to_string());
        self.next_seq
    }

    fn forget(&mut self, seq: u64) -> Option<String> {
        let id = self.id_of.remove(&seq)?;
        self.seq_of.remove(&id);
        self.inflight.remove(&id);
        Some(id)
    }
}

/// One consumer of one group on one stream key.
#[derive(Debug)]
struct GroupReader {
    client: Arc<redis::Client>,
    stream: String,
    key: String,
    group: String,
    consumer: String,
    durable: bool,
    ack_wait: Duration,
    max_inflight: usize,
    cancel: CancellationToken,
    state: Mutex<ReaderState>,
    status: Arc<Mutex<ConnectionStatus>>,
}

/// A stream entry pulled from Redis.
struct StreamEntry {
    id: String,
    payload: Bytes,
}

impl GroupReader {
    /// Create the group (idempotent). An existing group keeps its position.
    async fn create_group(&self, start: &'static str) -> Result<(), redis::RedisError> {
        let client = self.client.clone();
        let (key, group) = (self.key.clone(), self.group.clone());
        blocking(move || {
            let mut conn = client.get_connection()?;
            let created: redis::RedisResult<String> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&key)
                .arg(&group)
                .arg(start)
                .arg("MKSTREAM")
                .query(&mut conn);
            match created {
                Ok(_) => Ok(()),
                Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn destroy_group(&self) -> Result<(), BackendError> {
        let client = self.client.clone();
        let (key, group) = (self.key.clone(), self.group.clone());
        blocking(move || {
            let mut conn = client.get_connection()?;
            redis::cmd("XGROUP")
                .arg("DESTROY")
                .arg(&key)
                .arg(&group)
                .query::<i64>(&mut conn)
        })
        .await
        .map(|_| ())
        .map_err(|e| BackendError::subscribe(&self.stream, e))
    }

    async fn close(&self) -> Result<(), BackendError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.cancel.cancel();
        if self.durable {
            Ok(())
        } else {
            self.destroy_group().await
        }
    }

    async fn unsubscribe(&self) -> Result<(), BackendError> {
        self.cancel.cancel();
        self.destroy_group().await
    }

    /// Entries to deliver now: idle pending entries first (redeliveries), then
    /// new entries up to the in-flight cap.
    fn poll_sync(&self) -> Result<Vec<(StreamEntry, bool)>, redis::RedisError> {
        let mut conn = self.client.get_connection()?;
        let mut out: Vec<(StreamEntry, bool)> = self
            .claim_idle_sync(&mut conn)?
            .into_iter()
            .map(|e| (e, true))
            .collect();

        let capacity = {
            let state = lock_state(&self.state);
            self.max_inflight
                .saturating_sub(state.inflight.len() + out.len())
        };
        if capacity > 0 {
            out.extend(
                self.read_new_sync(&mut conn, capacity)?
                    .into_iter()
                    .map(|e| (e, false)),
            );
        }
        Ok(out)
    }

    fn claim_idle_sync(
        &self,
        conn: &mut redis::Connection,
    ) -> Result<Vec<StreamEntry>, redis::RedisError> {
        let min_idle_ms = self.ack_wait.as_millis() as u64;
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(self.max_inflight)
            .query(conn)?;

        let ids: Vec<String> = pending.into_iter().map(|(id, _, _, _)| id).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle_ms)
            .arg(&ids)
            .query(conn)?;
        Ok(parse_entries(claimed))
    }

    fn read_new_sync(
        &self,
        conn: &mut redis::Connection,
        count: usize,
    ) -> Result<Vec<StreamEntry>, redis::RedisError> {
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(BLOCK_MS)
            .arg("STREAMS")
            .arg(&self.key)
            .arg(">")
            .query(conn)?;

        // Reply: [[key, [entry, ...]]], or nil when the block timed out.
        let redis::Value::Bulk(streams) = reply else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for stream in streams {
            if let redis::Value::Bulk(mut parts) = stream {
                if parts.len() == 2 {
                    out.extend(parse_entries(parts.remove(1)));
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Acker for GroupReader {
    async fn ack(&self, sequence: u64) -> Result<(), BackendError> {
        if self.cancel.is_cancelled() {
            return Err(BackendError::Ack("subscription closed".into()));
        }
        let id = lock_state(&self.state)
            .id_of
            .get(&sequence)
            .cloned()
            .ok_or_else(|| BackendError::Ack(format!("unknown delivery {sequence}")))?;

        let client = self.client.clone();
        let (key, group, entry) = (self.key.clone(), self.group.clone(), id);
        let result = blocking(move || {
            let mut conn = client.get_connection()?;
            redis::cmd("XACK")
                .arg(&key)
                .arg(&group)
                .arg(&entry)
                .query::<u64>(&mut conn)
        })
        .await;
        track(&self.status, &result);
        result.map_err(|e| BackendError::Ack(e.to_string()))?;

        lock_state(&self.state).forget(sequence);
        Ok(())
    }
}

struct RedisHandle {
    reader: Arc<GroupReader>,
}

#[async_trait]
impl SubscriptionHandle for RedisHandle {
    async fn close(&self) -> Result<(), BackendError> {
        self.reader.close().await
    }

    async fn unsubscribe(&self) -> Result<(), BackendError> {
        self.reader.unsubscribe().await
    }
}

/// Track a new reader, dropping the ones already closed.
fn register(subs: &mut Vec<Arc<GroupReader>>, reader: Arc<GroupReader>) {
    subs.retain(|r| !r.cancel.is_cancelled());
    subs.push(reader);
}

async fn read_loop(reader: Arc<GroupReader>, tx: mpsc::Sender<RawMessage>) {
    let acker: Arc<dyn Acker> = reader.clone();

    while !reader.cancel.is_cancelled() {
        let polling = reader.clone();
        let polled = tokio::task::spawn_blocking(move || polling.poll_sync()).await;

        let pause = match polled {
            Ok(Ok(entries)) => {
                *lock(&reader.status) = ConnectionStatus::Connected;
                let idle = entries.is_empty();
                for (entry, redelivered) in entries {
                    let sequence = {
                        let mut state = lock_state(&reader.state);
                        state.inflight.insert(entry.id.clone());
                        state.sequence(&entry.id)
                    };
                    let msg = RawMessage::new(
                        entry.payload,
                        sequence,
                        entry_time(&entry.id),
                        reader.stream.clone(),
                        redelivered,
                        acker.clone(),
                    );
                    if tx.send(msg).await.is_err() {
                        return;
                    }
                }
                idle.then_some(IDLE_PAUSE)
            }
            Ok(Err(e)) => {
                *lock(&reader.status) = ConnectionStatus::Reconnecting;
                warn!(stream = %reader.stream, group = %reader.group, error = %e, "redis read failed");
                Some(ERROR_PAUSE)
            }
            Err(e) => {
                error!(stream = %reader.stream, group = %reader.group, error = %e, "redis reader task failed");
                return;
            }
        };

        if let Some(pause) = pause {
            tokio::select! {
                _ = reader.cancel.cancelled() => return,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

/// Parse `[[id, [field, value, ...]], ...]`. Deleted entries (nil) and
/// entries without a payload field are skipped.
fn parse_entries(value: redis::Value) -> Vec<StreamEntry> {
    let redis::Value::Bulk(entries) = value else {
        return Vec::new();
    };
    entries.into_iter().filter_map(parse_entry).collect()
}

fn parse_entry(entry: redis::Value) -> Option<StreamEntry> {
    let redis::Value::Bulk(mut parts) = entry else {
        return None;
    };
    if parts.len() < 2 {
        return None;
    }
    let fields = parts.remove(1);
    let id = match parts.remove(0) {
        redis::Value::Data(data) => String::from_utf8_lossy(&data).to_string(),
        redis::Value::Status(s) => s,
        _ => return None,
    };

    let redis::Value::Bulk(fields) = fields else {
        return None;
    };
    let mut payload = None;
    for pair in fields.chunks(2) {
        if let [redis::Value::Data(name), redis::Value::Data(value)] = pair {
            if name.as_slice() == PAYLOAD_FIELD.as_bytes() {
                payload = Some(Bytes::copy_from_slice(value));
            }
        }
    }
    Some(StreamEntry {
        id,
        payload: payload?,
    })
}

/// Millisecond timestamp embedded in a stream entry id (`<ms>-<seq>`).
fn entry_time(id: &str) -> DateTime<Utc> {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

async fn blocking<T, F>(f: F) -> Result<T, redis::RedisError>
where
    F: FnOnce() -> Result<T, redis::RedisError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(redis::RedisError::from((
            redis::ErrorKind::ClientError,
            "blocking task failed",
            e.to_string(),
        ))),
    }
}

/// Reflect a command outcome in the session status.
fn track<T>(status: &Mutex<ConnectionStatus>, result: &Result<T, redis::RedisError>) {
    let mut status = lock(status);
    if *status == ConnectionStatus::Closed {
        return;
    }
    *status = match result {
        Ok(_) => ConnectionStatus::Connected,
        Err(e) if e.is_connection_dropped() || e.is_io_error() => ConnectionStatus::Disconnected,
        Err(_) => *status,
    };
}

fn lock(status: &Mutex<ConnectionStatus>) -> MutexGuard<'_, ConnectionStatus> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock_state(state: &Mutex<ReaderState>) -> MutexGuard<'_, ReaderState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
