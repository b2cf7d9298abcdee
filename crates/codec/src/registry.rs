//! Codec contract and the name → codec lookup table.
//!
//! The registry is an explicit object rather than a hidden global: a
//! `Connection` owns one (shared via `Arc`) and every marshal/decode call goes
//! through it. Registration is additive and may overwrite an existing name;
//! there is no removal.
//!
//! ## Concurrency
//!
//! Lookups take a read lock and clone an `Arc`, so concurrent `get` calls never
//! block each other. `register` takes the write lock; registering while other
//! threads look up is safe, but the intended use is to register everything
//! during initialization.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::codecs::{BytesCodec, CborCodec, JsonCodec, NilCodec, ProtoCodec, StringCodec};
use crate::encoding;
use crate::error::CodecError;

/// A named strategy for turning a native value into bytes and back.
///
/// Codecs must be deterministic and must round-trip: unmarshaling the output of
/// `marshal(v)` into a target of the same shape reproduces `v`.
pub trait Codec: Send + Sync + 'static {
    /// Encode `value`, failing with [`CodecError::TypeMismatch`] when it is not
    /// a shape this codec accepts.
    fn marshal(&self, value: &dyn Any) -> Result<Vec<u8>, CodecError>;

    /// Decode `bytes` into `target`, failing with [`CodecError::TypeMismatch`]
    /// when the target is not a shape this codec can fill.
    fn unmarshal(&self, bytes: &[u8], target: &mut dyn Any) -> Result<(), CodecError>;
}

impl<C> Codec for Arc<C>
where
    C: Codec + ?Sized,
{
    fn marshal(&self, value: &dyn Any) -> Result<Vec<u8>, CodecError> {
        (**self).marshal(value)
    }

    fn unmarshal(&self, bytes: &[u8], target: &mut dyn Any) -> Result<(), CodecError> {
        (**self).unmarshal(bytes, target)
    }
}

/// Lookup table from encoding name to codec.
pub struct CodecRegistry {
    codecs: RwLock<HashMap<String, Arc<dyn Codec>>>,
}

impl CodecRegistry {
    /// A registry with no codecs at all.
    pub fn empty() -> Self {
        Self {
            codecs: RwLock::new(HashMap::new()),
        }
    }

    /// A registry pre-populated with the built-in encodings:
    /// `bytes`, `string`, `json`, `proto`, `cbor` and `nil`.
    pub fn standard() -> Self {
        let registry = Self::empty();
        registry.register(encoding::BYTES, BytesCodec);
        registry.register(encoding::STRING, StringCodec);
        registry.register(encoding::JSON, JsonCodec);
        registry.register(encoding::PROTO, ProtoCodec);
        registry.register(encoding::CBOR, CborCodec);
        registry.register(encoding::NIL, NilCodec);
        registry
    }

    /// Register `codec` under `name`, replacing any codec already registered
    /// under that name.
    pub fn register(&self, name: impl Into<String>, codec: impl Codec) {
        self.register_arc(name, Arc::new(codec));
    }

    pub fn register_arc(&self, name: impl Into<String>, codec: Arc<dyn Codec>) {
        let mut codecs = self.codecs.write().unwrap_or_else(PoisonError::into_inner);
        codecs.insert(name.into(), codec);
    }

    /// The codec registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Codec>> {
        let codecs = self.codecs.read().unwrap_or_else(PoisonError::into_inner);
        codecs.get(name).cloned()
    }

    /// Like [`get`](Self::get) but reports a missing codec as
    /// [`CodecError::UnknownEncoding`].
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Codec>, CodecError> {
        self.get(name).ok_or_else(|| CodecError::unknown(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        let codecs = self.codecs.read().unwrap_or_else(PoisonError::into_inner);
        codecs.contains_key(name)
    }

    /// Registered encoding names, sorted.
    pub fn encodings(&self) -> Vec<String> {
        let codecs = self.codecs.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = codecs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Marshal `value` with the codec registered under `encoding`.
    pub fn marshal(&self, encoding: &str, value: &dyn Any) -> Result<Vec<u8>, CodecError> {
        self.lookup(encoding)?.marshal(value)
    }

    /// Unmarshal `bytes` into `target` with the codec registered under `encoding`.
    pub fn unmarshal(
        &self,
        encoding: &str,
        bytes: &[u8],
        target: &mut dyn Any,
    ) -> Result<(), CodecError> {
        self.lookup(encoding)?.unmarshal(bytes, target)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl core::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("encodings", &self.encodings())
            .finish()
    }
}
