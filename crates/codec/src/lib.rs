//! `eventline-codec`: named payload codecs and the registry that resolves them.
//!
//! A codec turns an in-memory value into bytes and back. Every payload on the
//! wire carries the name of the codec that produced it, so consumers can pick
//! the matching codec at decode time without knowing the payload type up front.
//!
//! Values cross the codec boundary as `&dyn Any` / `&mut dyn Any`; each codec
//! downcasts to the shape it understands and reports a type mismatch otherwise.

pub mod codecs;
pub mod error;
pub mod proto;
pub mod registry;

pub use codecs::{BytesCodec, CborCodec, JsonCodec, NilCodec, ProtoCodec, StringCodec};
pub use error::CodecError;
pub use proto::{DynMessage, ProtoValue};
pub use registry::{Codec, CodecRegistry};

/// Names of the built-in encodings.
pub mod encoding {
    pub const BYTES: &str = "bytes";
    pub const STRING: &str = "string";
    pub const JSON: &str = "json";
    pub const PROTO: &str = "proto";
    pub const CBOR: &str = "cbor";
    /// Encoding tag of an envelope that carries no payload.
    pub const NIL: &str = "nil";
}
