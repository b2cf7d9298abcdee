//! `eventline-core`: identity and time primitives shared by every layer.
//!
//! This crate has no IO and no async; it only knows how to mint envelope IDs and
//! how to move timestamps in and out of their wire representation.

pub mod error;
pub mod id;
pub mod time;

pub use error::{CoreError, CoreResult};
pub use id::{IdGenerator, next_id, reset_generator, set_generator};
pub use time::{from_unix_nanos, to_unix_nanos};
