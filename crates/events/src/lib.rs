//! Event envelopes and the stream backend boundary.
//!
//! - [`Data`]: a payload tagged with its codec, encoded lazily.
//! - [`Event`], [`Command`], [`Message`], [`Reply`]: envelopes carrying
//!   identity, timing and causal metadata around a payload.
//! - [`Envelope`]: marshal/unmarshal to the protobuf wire record.
//! - [`Backend`] and friends: what the library needs from a durable stream
//!   engine, with [`InMemoryServer`] as the in-process implementation.

pub mod bus;
pub mod command;
pub mod data;
pub mod envelope;
pub mod error;
pub mod event;
pub mod in_memory_bus;
pub mod message;
pub mod reply;
pub mod wire;

pub use bus::{
    Acker, Backend, BackendError, BackendSubscription, ConnectionStatus, Connector, RawMessage,
    StartPosition, SubscribeRequest, SubscriptionHandle,
};
pub use command::Command;
pub use data::Data;
pub use envelope::Envelope;
pub use error::{DataError, WireError};
pub use event::{Delivery, Event};
pub use in_memory_bus::{InMemoryServer, InMemorySession};
pub use message::Message;
pub use reply::{Code, Reply};
