//! Opaque message envelope
//!
//! The payload carried from a publisher through the broker to every
//! subscriber callback. The router never looks inside `value`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A typed, opaque payload (the shape of a protobuf `Any`)
///
/// Cheap to clone: `Bytes` is reference counted, so fanning one delivery out
/// to N callbacks shares a single allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Type identifier of the encoded message (e.g. `type.googleapis.com/ukama.events.v1.NodeCreated`)
    #[serde(default)]
    pub type_url: String,
    /// Encoded message bytes
    #[serde(with = "base64_bytes")]
    pub value: Bytes,
}

impl Envelope {
    pub fn new(type_url: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            type_url: type_url.into(),
            value: value.into(),
        }
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// Base64 for payload bytes on JSON wires
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_uses_base64() {
        let envelope = Envelope::new("test.Ping", Bytes::from_static(b"hello"));
        let json = serde_json::to_string(&envelope).unwrap();

        assert_eq!(json, r#"{"type_url":"test.Ping","value":"aGVsbG8="}"#);
    }

    #[test]
    fn test_rejects_bad_base64() {
        let result: Result<Envelope, _> =
            serde_json::from_str(r#"{"type_url":"t","value":"not base64!"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_type_url_defaults() {
        let envelope: Envelope = serde_json::from_str(r#"{"value":""}"#).unwrap();
        assert!(envelope.type_url.is_empty());
        assert!(envelope.is_empty());
    }
}
