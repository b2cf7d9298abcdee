//! Infrastructure-backed stream engines.
//!
//! The backend contract lives in `eventline-events` (`Backend`, `Connector`),
//! along with the in-memory implementation. This module provides the ones
//! that talk to real servers.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsConnector, RedisStreamsSession};
