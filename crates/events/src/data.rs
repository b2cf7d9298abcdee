//! Tagged payload container.
//!
//! A [`Data`] is either a native value waiting to be encoded, or bytes that
//! some codec already produced. Values received from the wire are always in
//! the encoded state; decoding happens lazily, into whatever target type the
//! consumer asks for, and never consumes the bytes.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;

use eventline_codec::{CodecRegistry, ProtoValue, encoding};

use crate::error::DataError;
use crate::wire::{DataRecord, non_empty};

type AnyValue = Arc<dyn Any + Send + Sync>;

/// A payload tagged with the name of its codec.
#[derive(Clone)]
pub enum Data {
    /// A native value that has not been encoded yet.
    Unencoded {
        value: AnyValue,
        encoding: String,
        schema: Option<String>,
    },
    /// Bytes produced by the codec named in `encoding`.
    Encoded {
        bytes: Bytes,
        encoding: String,
        schema: Option<String>,
    },
}

impl Data {
    /// Wrap `value` to be encoded later with the codec named `encoding`.
    pub fn new(encoding: impl Into<String>, value: impl Any + Send + Sync) -> Self {
        Data::Unencoded {
            value: Arc::new(value),
            encoding: encoding.into(),
            schema: None,
        }
    }

    pub fn bytes(value: impl Into<Bytes>) -> Self {
        Self::new(encoding::BYTES, value.into())
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new(encoding::STRING, value.into())
    }

    /// Serialize `value` into the JSON value model and tag it `json`.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, DataError> {
        Ok(Self::json_value(to_json(value)?))
    }

    pub fn json_value(value: JsonValue) -> Self {
        Self::new(encoding::JSON, value)
    }

    /// Like [`json`](Self::json) but encoded as CBOR.
    pub fn cbor<T: Serialize + ?Sized>(value: &T) -> Result<Self, DataError> {
        Ok(Self::new(encoding::CBOR, to_json(value)?))
    }

    pub fn proto<M>(message: M) -> Self
    where
        M: prost::Message + Default + 'static,
    {
        Self::new(encoding::PROTO, ProtoValue::new(message))
    }

    /// Bytes as received from the wire.
    pub fn from_encoded(
        encoding: impl Into<String>,
        bytes: impl Into<Bytes>,
        schema: Option<String>,
    ) -> Self {
        Data::Encoded {
            bytes: bytes.into(),
            encoding: encoding.into(),
            schema,
        }
    }

    pub fn with_schema(mut self, value: impl Into<String>) -> Self {
        match &mut self {
            Data::Unencoded { schema, .. } | Data::Encoded { schema, .. } => {
                *schema = Some(value.into())
            }
        }
        self
    }

    pub fn encoding(&self) -> &str {
        match self {
            Data::Unencoded { encoding, .. } | Data::Encoded { encoding, .. } => encoding,
        }
    }

    pub fn schema(&self) -> Option<&str> {
        match self {
            Data::Unencoded { schema, .. } | Data::Encoded { schema, .. } => schema.as_deref(),
        }
    }

    pub fn is_encoded(&self) -> bool {
        matches!(self, Data::Encoded { .. })
    }

    pub fn encoded_bytes(&self) -> Option<&Bytes> {
        match self {
            Data::Encoded { bytes, .. } => Some(bytes),
            Data::Unencoded { .. } => None,
        }
    }

    /// Borrow the unencoded value as `T`.
    pub fn value_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Data::Unencoded { value, .. } => value.downcast_ref::<T>(),
            Data::Encoded { .. } => None,
        }
    }

    /// Replace the payload with a new native value, dropping any cached bytes.
    /// The encoding and schema are kept.
    pub fn set(&mut self, value: impl Any + Send + Sync) {
        let (encoding, schema) = match self {
            Data::Unencoded {
                encoding, schema, ..
            }
            | Data::Encoded {
                encoding, schema, ..
            } => (std::mem::take(encoding), schema.take()),
        };
        *self = Data::Unencoded {
            value: Arc::new(value),
            encoding,
            schema,
        };
    }

    /// Produce the payload bytes, running the codec if the value is not
    /// encoded yet.
    pub fn encode(&self, registry: &CodecRegistry) -> Result<Bytes, DataError> {
        match self {
            Data::Encoded { bytes, .. } => Ok(bytes.clone()),
            Data::Unencoded {
                value, encoding, ..
            } => {
                if encoding.is_empty() {
                    return Err(DataError::NoEncoding);
                }
                let value: &dyn Any = &**value;
                Ok(Bytes::from(registry.marshal(encoding, value)?))
            }
        }
    }

    /// Decode the received bytes into `target` with the codec named by the
    /// stored encoding.
    pub fn decode_into(
        &self,
        registry: &CodecRegistry,
        target: &mut dyn Any,
    ) -> Result<(), DataError> {
        match self {
            Data::Encoded {
                bytes, encoding, ..
            } => Ok(registry.unmarshal(encoding, bytes, target)?),
            Data::Unencoded { .. } => Err(DataError::NoData),
        }
    }

    /// Decode into a fresh `T`, for codecs whose target shape is `T` itself
    /// (`String`, `Vec<u8>`, `serde_json::Value`, ...).
    pub fn decode<T: Any + Default>(&self, registry: &CodecRegistry) -> Result<T, DataError> {
        let mut out = T::default();
        self.decode_into(registry, &mut out)?;
        Ok(out)
    }

    /// Decode a `json` or `cbor` payload straight into a deserializable type.
    pub fn decode_json<T: DeserializeOwned>(
        &self,
        registry: &CodecRegistry,
    ) -> Result<T, DataError> {
        let value: JsonValue = self.decode(registry)?;
        serde_json::from_value(value).map_err(|e| DataError::Convert(e.to_string()))
    }

    /// Decode a `proto` payload into the message type `M`.
    pub fn decode_proto<M>(&self, registry: &CodecRegistry) -> Result<M, DataError>
    where
        M: prost::Message + Default + 'static,
    {
        let mut target = ProtoValue::empty::<M>();
        self.decode_into(registry, &mut target)?;
        target
            .into_message::<M>()
            .ok_or_else(|| DataError::Convert("decoded message has an unexpected type".into()))
    }

    pub fn to_record(&self, registry: &CodecRegistry) -> Result<DataRecord, DataError> {
        Ok(DataRecord {
            schema: self.schema().unwrap_or_default().to_string(),
            encoding: self.encoding().to_string(),
            data: self.encode(registry)?,
        })
    }

    /// Rebuild from a wire record. A `nil` or empty encoding means no payload.
    pub fn from_record(record: DataRecord) -> Option<Self> {
        Self::from_wire(record.encoding, record.data, record.schema)
    }

    pub(crate) fn from_wire(encoding: String, bytes: Bytes, schema: String) -> Option<Self> {
        if encoding.is_empty() || encoding == encoding::NIL {
            return None;
        }
        Some(Data::Encoded {
            bytes,
            encoding,
            schema: non_empty(schema),
        })
    }

    /// Bytes used for the human-readable rendering. Unencoded values go
    /// through the built-in codecs.
    fn render_bytes(&self) -> Option<Bytes> {
        static BUILTIN: OnceLock<CodecRegistry> = OnceLock::new();
        self.encode(BUILTIN.get_or_init(CodecRegistry::standard)).ok()
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<JsonValue, DataError> {
    serde_json::to_value(value).map_err(|e| DataError::Convert(e.to_string()))
}

/// Encoding of an optional payload as written on the wire.
pub(crate) fn record_of(
    data: Option<&Data>,
    registry: &CodecRegistry,
) -> Result<DataRecord, DataError> {
    match data {
        Some(data) => data.to_record(registry),
        None => Ok(DataRecord {
            encoding: encoding::NIL.to_string(),
            ..Default::default()
        }),
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Data::Unencoded {
                encoding, schema, ..
            } => f
                .debug_struct("Unencoded")
                .field("encoding", encoding)
                .field("schema", schema)
                .finish_non_exhaustive(),
            Data::Encoded {
                bytes,
                encoding,
                schema,
            } => f
                .debug_struct("Encoded")
                .field("encoding", encoding)
                .field("schema", schema)
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

/// Debug rendering: `json` payloads inline, `string` payloads as text,
/// everything else as a byte array.
impl Serialize for Data {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("encoding", self.encoding())?;
        if let Some(schema) = self.schema() {
            map.serialize_entry("schema", schema)?;
        }

        let bytes = self.render_bytes();
        match (self.encoding(), bytes) {
            (_, None) => map.serialize_entry("value", &JsonValue::Null)?,
            (encoding::JSON, Some(b)) => match serde_json::from_slice::<JsonValue>(&b) {
                Ok(v) => map.serialize_entry("value", &v)?,
                Err(_) => map.serialize_entry("value", b.as_ref())?,
            },
            (encoding::STRING, Some(b)) => match std::str::from_utf8(&b) {
                Ok(s) => map.serialize_entry("value", s)?,
                Err(_) => map.serialize_entry("value", b.as_ref())?,
            },
            (_, Some(b)) => map.serialize_entry("value", b.as_ref())?,
        }
        map.end()
    }
}
