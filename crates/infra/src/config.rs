//! Connection and subscription configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use eventline_events::StartPosition;

use crate::error::{Error, Result};

pub const DEFAULT_ADDRESS: &str = "nats://localhost:4222";
pub const DEFAULT_CLUSTER: &str = "test-cluster";
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// In-flight cap used when a subscription is not serial.
pub const DEFAULT_MAX_INFLIGHT: usize = 1024;

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Backend address
    pub address: String,
    /// Cluster the backend must belong to
    pub cluster: String,
    /// Identity of this connection; stamped on everything it publishes
    pub client_id: String,
    /// How often the status monitor polls the backend
    #[serde(with = "millis")]
    pub monitor_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            cluster: DEFAULT_CLUSTER.to_string(),
            client_id: String::new(),
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
        }
    }
}

impl ConnectionConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Read `EVENTLINE_ADDR`, `EVENTLINE_CLUSTER`, `EVENTLINE_CLIENT_ID` and
    /// `EVENTLINE_MONITOR_INTERVAL_MS`, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(address) = lookup("EVENTLINE_ADDR") {
            config.address = address;
        }
        if let Some(cluster) = lookup("EVENTLINE_CLUSTER") {
            config.cluster = cluster;
        }
        if let Some(client_id) = lookup("EVENTLINE_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Some(ms) = lookup("EVENTLINE_MONITOR_INTERVAL_MS") {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                Error::invalid_config(format!("EVENTLINE_MONITOR_INTERVAL_MS is not a number: {ms}"))
            })?;
            config.monitor_interval = Duration::from_millis(ms);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(Error::invalid_config("client id is required"));
        }
        if self.cluster.is_empty() {
            return Err(Error::invalid_config("cluster is required"));
        }
        if self.monitor_interval.is_zero() {
            return Err(Error::invalid_config("monitor interval must be positive"));
        }
        Ok(())
    }
}

/// How a handler is bound to a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Identity whose offset is tracked; defaults to the connection's client id.
    pub consumer_name: Option<String>,
    /// Persist the offset across reconnects under `consumer_name`.
    pub durable: bool,
    /// Discard any stored offset before subscribing.
    pub reset: bool,
    /// At most one unacknowledged delivery at a time; handlers see strict
    /// stream order.
    pub serial: bool,
    /// How long the backend waits for an ack before redelivering. Also the
    /// handler's deadline.
    #[serde(with = "millis")]
    pub ack_timeout: Duration,
    /// Where a consumer with no stored offset starts.
    pub start_position: StartPosition,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            consumer_name: None,
            durable: true,
            reset: false,
            serial: true,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            start_position: StartPosition::First,
        }
    }
}

impl SubscriptionConfig {
    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = Some(name.into());
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    pub fn with_serial(mut self, serial: bool) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_start_position(mut self, position: StartPosition) -> Self {
        self.start_position = position;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ack_timeout.is_zero() {
            return Err(Error::invalid_config("ack timeout must be positive"));
        }
        if self.consumer_name.as_deref() == Some("") {
            return Err(Error::invalid_config("consumer name must not be empty"));
        }
        Ok(())
    }

    pub(crate) fn max_inflight(&self) -> usize {
        if self.serial { 1 } else { DEFAULT_MAX_INFLIGHT }
    }
}

/// Durations as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
