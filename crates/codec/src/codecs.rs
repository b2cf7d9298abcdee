//! Built-in codecs.
//!
//! | encoding | value shape                      | decode target            |
//! |----------|----------------------------------|--------------------------|
//! | `bytes`  | `Vec<u8>`, `bytes::Bytes`        | `Vec<u8>`, `bytes::Bytes`|
//! | `string` | `String`, `&'static str`         | `String`                 |
//! | `json`   | `serde_json::Value`              | `serde_json::Value`      |
//! | `cbor`   | `serde_json::Value`              | `serde_json::Value`      |
//! | `proto`  | [`ProtoValue`]                   | [`ProtoValue`]           |
//! | `nil`    | anything (encodes to no bytes)   | anything (no-op)         |

use std::any::Any;

use bytes::Bytes;
use serde_json::Value as JsonValue;

use crate::error::CodecError;
use crate::proto::ProtoValue;
use crate::registry::Codec;

/// Identity codec for raw byte sequences.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    fn marshal(&self, value: &dyn Any) -> Result<Vec<u8>, CodecError> {
        if let Some(b) = value.downcast_ref::<Vec<u8>>() {
            return Ok(b.clone());
        }
        if let Some(b) = value.downcast_ref::<Bytes>() {
            return Ok(b.to_vec());
        }
        Err(CodecError::mismatch("bytes", "byte sequence"))
    }

    fn unmarshal(&self, bytes: &[u8], target: &mut dyn Any) -> Result<(), CodecError> {
        if let Some(out) = target.downcast_mut::<Vec<u8>>() {
            *out = bytes.to_vec();
            return Ok(());
        }
        if let Some(out) = target.downcast_mut::<Bytes>() {
            *out = Bytes::copy_from_slice(bytes);
            return Ok(());
        }
        Err(CodecError::mismatch("bytes", "Vec<u8> or Bytes target"))
    }
}

/// UTF-8 text.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringCodec;

impl Codec for StringCodec {
    fn marshal(&self, value: &dyn Any) -> Result<Vec<u8>, CodecError> {
        if let Some(s) = value.downcast_ref::<String>() {
            return Ok(s.as_bytes().to_vec());
        }
        if let Some(s) = value.downcast_ref::<&'static str>() {
            return Ok(s.as_bytes().to_vec());
        }
        Err(CodecError::mismatch("string", "string"))
    }

    fn unmarshal(&self, bytes: &[u8], target: &mut dyn Any) -> Result<(), CodecError> {
        let out = target
            .downcast_mut::<String>()
            .ok_or_else(|| CodecError::mismatch("string", "String target"))?;
        *out = String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::decode("string", e))?;
        Ok(())
    }
}

/// JSON text. Typed values are converted to a `serde_json::Value` before they
/// reach the codec (see `Data::json` in `eventline-events`).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn marshal(&self, value: &dyn Any) -> Result<Vec<u8>, CodecError> {
        let v = value
            .downcast_ref::<JsonValue>()
            .ok_or_else(|| CodecError::mismatch("json", "serde_json::Value"))?;
        serde_json::to_vec(v).map_err(|e| CodecError::encode("json", e))
    }

    fn unmarshal(&self, bytes: &[u8], target: &mut dyn Any) -> Result<(), CodecError> {
        let out = target
            .downcast_mut::<JsonValue>()
            .ok_or_else(|| CodecError::mismatch("json", "serde_json::Value target"))?;
        *out = serde_json::from_slice(bytes).map_err(|e| CodecError::decode("json", e))?;
        Ok(())
    }
}

/// CBOR (RFC 8949) structured binary over the same value model as `json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn marshal(&self, value: &dyn Any) -> Result<Vec<u8>, CodecError> {
        let v = value
            .downcast_ref::<JsonValue>()
            .ok_or_else(|| CodecError::mismatch("cbor", "serde_json::Value"))?;
        let mut buf = Vec::new();
        ciborium::into_writer(v, &mut buf).map_err(|e| CodecError::encode("cbor", e))?;
        Ok(buf)
    }

    fn unmarshal(&self, bytes: &[u8], target: &mut dyn Any) -> Result<(), CodecError> {
        let out = target
            .downcast_mut::<JsonValue>()
            .ok_or_else(|| CodecError::mismatch("cbor", "serde_json::Value target"))?;
        *out = ciborium::from_reader(bytes).map_err(|e| CodecError::decode("cbor", e))?;
        Ok(())
    }
}

/// Protocol Buffers via `prost`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtoCodec;

impl Codec for ProtoCodec {
    fn marshal(&self, value: &dyn Any) -> Result<Vec<u8>, CodecError> {
        let v = value
            .downcast_ref::<ProtoValue>()
            .ok_or_else(|| CodecError::mismatch("proto", "ProtoValue"))?;
        Ok(v.message().encode_to_bytes())
    }

    fn unmarshal(&self, bytes: &[u8], target: &mut dyn Any) -> Result<(), CodecError> {
        let out = target
            .downcast_mut::<ProtoValue>()
            .ok_or_else(|| CodecError::mismatch("proto", "ProtoValue target"))?;
        out.message_mut()
            .replace_from(bytes)
            .map_err(|e| CodecError::decode("proto", e))
    }
}

/// The "no payload" codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct NilCodec;

impl Codec for NilCodec {
    fn marshal(&self, _value: &dyn Any) -> Result<Vec<u8>, CodecError> {
        Ok(Vec::new())
    }

    fn unmarshal(&self, _bytes: &[u8], _target: &mut dyn Any) -> Result<(), CodecError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Ping {
        #[prost(string, tag = "1")]
        id: String,
        #[prost(int64, tag = "2")]
        seq: i64,
        #[prost(bytes = "vec", tag = "3")]
        body: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Pong {
        #[prost(string, tag = "1")]
        reply_to: String,
    }

    fn json_value() -> impl Strategy<Value = JsonValue> {
        let leaf = prop_oneof![
            Just(JsonValue::Null),
            any::<bool>().prop_map(JsonValue::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            ".{0,16}".prop_map(JsonValue::String),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(JsonValue::Array),
                prop::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                    .prop_map(|m| JsonValue::Object(m.into_iter().collect())),
            ]
        })
    }

    #[test]
    fn bytes_codec_accepts_vec_and_bytes() {
        let c = BytesCodec;
        assert_eq!(c.marshal(&b"foo".to_vec()).unwrap(), b"foo");
        assert_eq!(c.marshal(&Bytes::from_static(b"bar")).unwrap(), b"bar");

        let mut out = Bytes::new();
        c.unmarshal(b"baz", &mut out).unwrap();
        assert_eq!(&out[..], b"baz");
    }

    #[test]
    fn bytes_codec_rejects_non_byte_values() {
        let err = BytesCodec.marshal(&"foo".to_string()).unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { codec: "bytes", .. }));

        let mut wrong = String::new();
        let err = BytesCodec.unmarshal(b"foo", &mut wrong).unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { codec: "bytes", .. }));
    }

    #[test]
    fn string_codec_accepts_static_str_and_rejects_invalid_utf8() {
        assert_eq!(StringCodec.marshal(&"foo").unwrap(), b"foo");

        let mut out = String::new();
        let err = StringCodec.unmarshal(&[0xff, 0xfe], &mut out).unwrap_err();
        assert!(matches!(err, CodecError::Decode { codec: "string", .. }));
    }

    #[test]
    fn json_codec_requires_json_value() {
        let err = JsonCodec.marshal(&42u32).unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { codec: "json", .. }));

        let mut out = JsonValue::Null;
        let err = JsonCodec.unmarshal(b"{not json", &mut out).unwrap_err();
        assert!(matches!(err, CodecError::Decode { codec: "json", .. }));
    }

    #[test]
    fn json_codec_is_deterministic_for_objects() {
        let v = json!({"b": 1, "a": [true, null, "x"]});
        assert_eq!(JsonCodec.marshal(&v).unwrap(), JsonCodec.marshal(&v).unwrap());
    }

    #[test]
    fn proto_codec_round_trips_typed_message() {
        let msg = Ping {
            id: "foo".to_string(),
            seq: 7,
            body: vec![1, 2, 3],
        };
        let bytes = ProtoCodec.marshal(&ProtoValue::new(msg.clone())).unwrap();

        let mut target = ProtoValue::empty::<Ping>();
        ProtoCodec.unmarshal(&bytes, &mut target).unwrap();
        assert_eq!(target.downcast_ref::<Ping>(), Some(&msg));
        assert_eq!(target.into_message::<Ping>(), Some(msg));
    }

    #[test]
    fn proto_target_replaces_previous_contents() {
        let mut target = ProtoValue::new(Pong {
            reply_to: "stale".to_string(),
        });
        let bytes = ProtoCodec.marshal(&ProtoValue::new(Pong::default())).unwrap();
        ProtoCodec.unmarshal(&bytes, &mut target).unwrap();
        assert_eq!(target.into_message::<Pong>(), Some(Pong::default()));
    }

    #[test]
    fn proto_codec_rejects_raw_messages() {
        let err = ProtoCodec.marshal(&Ping::default()).unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { codec: "proto", .. }));
    }

    #[test]
    fn nil_codec_encodes_nothing() {
        assert!(NilCodec.marshal(&"ignored").unwrap().is_empty());
        let mut anything = 5u8;
        NilCodec.unmarshal(b"ignored", &mut anything).unwrap();
        assert_eq!(anything, 5);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: bytes round-trip unchanged.
        #[test]
        fn bytes_round_trip(v in prop::collection::vec(any::<u8>(), 0..512)) {
            let encoded = BytesCodec.marshal(&v).unwrap();
            let mut out: Vec<u8> = Vec::new();
            BytesCodec.unmarshal(&encoded, &mut out).unwrap();
            prop_assert_eq!(out, v);
        }

        /// Property: any UTF-8 string round-trips unchanged.
        #[test]
        fn string_round_trip(v in ".*") {
            let encoded = StringCodec.marshal(&v).unwrap();
            let mut out = String::new();
            StringCodec.unmarshal(&encoded, &mut out).unwrap();
            prop_assert_eq!(out, v);
        }

        /// Property: JSON documents (without floats) round-trip unchanged.
        #[test]
        fn json_round_trip(v in json_value()) {
            let encoded = JsonCodec.marshal(&v).unwrap();
            let mut out = JsonValue::Null;
            JsonCodec.unmarshal(&encoded, &mut out).unwrap();
            prop_assert_eq!(out, v);
        }

        /// Property: the same documents round-trip through CBOR.
        #[test]
        fn cbor_round_trip(v in json_value()) {
            let encoded = CborCodec.marshal(&v).unwrap();
            let mut out = JsonValue::Null;
            CborCodec.unmarshal(&encoded, &mut out).unwrap();
            prop_assert_eq!(out, v);
        }

        /// Property: protobuf messages round-trip unchanged.
        #[test]
        fn proto_round_trip(
            id in "[a-z0-9]{0,24}",
            seq in any::<i64>(),
            body in prop::collection::vec(any::<u8>(), 0..64),
        ) {
            let msg = Ping { id, seq, body };
            let encoded = ProtoCodec.marshal(&ProtoValue::new(msg.clone())).unwrap();
            let mut target = ProtoValue::empty::<Ping>();
            ProtoCodec.unmarshal(&encoded, &mut target).unwrap();
            prop_assert_eq!(target.into_message::<Ping>(), Some(msg));
        }
    }
}
