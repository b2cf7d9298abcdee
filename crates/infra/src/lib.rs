//! Connection, publisher and subscription controller over a durable stream
//! backend.

pub mod config;
pub mod connection;
pub mod error;
pub mod event_bus;
pub mod handler;
mod monitor;
pub mod publisher;
pub mod subscription;

#[cfg(test)]
mod integration_tests;

pub use config::{ConnectionConfig, SubscriptionConfig};
pub use connection::Connection;
pub use error::{Error, Result};
pub use handler::{Handler, HandlerContext, HandlerError, HandlerResult};
pub use subscription::Subscription;
