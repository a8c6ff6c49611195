//! Envelope encodings. JSON is the default for HTTP; `MsgPack` uses named
//! fields (`rmp_serde::to_vec_named`) so both encodings share one schema.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CoreError;

/// Encodes and decodes wire envelopes.
pub trait WireCodec: Send + Sync {
    /// MIME type of the encoded payload.
    fn content_type(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] when the value cannot be encoded.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CoreError>
    where
        Self: Sized;

    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] when the bytes are not a valid `T`.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CoreError>
    where
        Self: Sized;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl WireCodec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(value).map_err(|e| CoreError::Codec(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CoreError> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::Codec(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl WireCodec for MsgPackCodec {
    fn content_type(&self) -> &'static str {
        "application/msgpack"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec_named(value).map_err(|e| CoreError::Codec(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{
        ChangeSetRequest, ChangeType, DbSetChanges, RowInfo, TrackAssoc, ValueChange,
    };

    fn request() -> ChangeSetRequest {
        ChangeSetRequest {
            db_sets: vec![DbSetChanges {
                db_set_name: "Customer".into(),
                rows: vec![RowInfo::new(ChangeType::Added, "c1")
                    .value(ValueChange::changed("Name", Some("Ann")))],
            }],
            track_assocs: vec![TrackAssoc {
                assoc_name: "CustomerAddresses".into(),
                parent_key: "c1".into(),
                child_key: "a1".into(),
            }],
        }
    }

    #[test]
    fn msgpack_preserves_change_set() {
        let codec = MsgPackCodec;
        let bytes = codec.encode(&request()).unwrap();
        let back: ChangeSetRequest = codec.decode(&bytes).unwrap();
        assert_eq!(back, request());
    }

    #[test]
    fn json_decode_error_is_codec_error() {
        let err = JsonCodec.decode::<ChangeSetRequest>(b"{not json").unwrap_err();
        assert!(matches!(err, CoreError::Codec(_)));
        assert_eq!(JsonCodec.content_type(), "application/json");
    }
}
