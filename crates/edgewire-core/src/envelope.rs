//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Envelope and transport message data model."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata key used by router middleware to carry the correlation identifier.
pub const CORRELATION_ID_KEY: &str = "correlation_id";
/// Metadata key carrying the envelope content type for raw wire formats.
pub const CONTENT_TYPE_KEY: &str = "edgex_content_type";
/// Metadata key carrying the envelope checksum for raw wire formats.
pub const CHECKSUM_KEY: &str = "edgex_checksum";

/// MIME string for JSON payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// MIME string for the CBOR binary fallback.
pub const CONTENT_TYPE_CBOR: &str = "application/cbor";

/// Ordered string metadata attached to a transport message.
pub type Metadata = IndexMap<String, String>;

/// Generate a fresh unique identifier for messages and correlation ids.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Content type of an envelope payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ContentType {
    /// `application/json`
    #[default]
    Json,
    /// `application/cbor`, the binary fallback.
    Cbor,
    /// Any other content type carried through verbatim.
    Other(String),
}

impl ContentType {
    /// Infer the content type from the first payload byte.
    ///
    /// `{` or `[` selects JSON; anything else, including an empty payload, selects CBOR.
    pub fn infer(payload: &[u8]) -> Self {
        match payload.first() {
            Some(b'{') | Some(b'[') => ContentType::Json,
            _ => ContentType::Cbor,
        }
    }

    /// MIME representation.
    pub fn as_str(&self) -> &str {
        match self {
            ContentType::Json => CONTENT_TYPE_JSON,
            ContentType::Cbor => CONTENT_TYPE_CBOR,
            ContentType::Other(raw) => raw,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ContentType {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            CONTENT_TYPE_JSON => ContentType::Json,
            CONTENT_TYPE_CBOR => ContentType::Cbor,
            _ => ContentType::Other(value),
        }
    }
}

impl From<&str> for ContentType {
    fn from(value: &str) -> Self {
        ContentType::from(value.to_owned())
    }
}

impl From<ContentType> for String {
    fn from(value: ContentType) -> Self {
        match value {
            ContentType::Other(raw) => raw,
            other => other.as_str().to_owned(),
        }
    }
}

impl FromStr for ContentType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ContentType::from(s))
    }
}

/// Canonical message unit exchanged with the host framework.
///
/// Field names follow the EdgeX message envelope so that JSON and CBOR encodings
/// interoperate with other EdgeX services.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Topic the envelope was received on; empty for outbound envelopes.
    #[serde(rename = "ReceivedTopic", default)]
    pub received_topic: String,
    /// Correlation identifier of the logical request.
    #[serde(rename = "CorrelationID", default)]
    pub correlation_id: String,
    /// Application payload.
    #[serde(rename = "Payload", default, with = "payload_bytes")]
    pub payload: Vec<u8>,
    /// Payload content type.
    #[serde(rename = "ContentType", default)]
    pub content_type: ContentType,
    /// Optional checksum, only populated by some wire formats.
    #[serde(rename = "Checksum", default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Envelope {
    /// Construct an envelope from its essential parts.
    pub fn new(
        correlation_id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        content_type: ContentType,
    ) -> Self {
        Self {
            received_topic: String::new(),
            correlation_id: correlation_id.into(),
            payload: payload.into(),
            content_type,
            checksum: None,
        }
    }

    /// Attach a checksum.
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

/// Backend-agnostic unit exchanged with the pub/sub library.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportMessage {
    /// Message identifier.
    pub uuid: String,
    /// Raw bytes on the wire.
    pub payload: Vec<u8>,
    /// Ordered string metadata.
    pub metadata: Metadata,
}

impl TransportMessage {
    /// Construct a message with empty metadata.
    pub fn new(uuid: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid: uuid.into(),
            payload: payload.into(),
            metadata: Metadata::new(),
        }
    }

    /// Read a metadata value, treating absent keys as empty.
    pub fn metadata_value(&self, key: &str) -> &str {
        self.metadata.get(key).map(String::as_str).unwrap_or("")
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }
}

/// Payload encoding: base64 text for human-readable formats (JSON), byte strings otherwise.
mod payload_bytes {
    use std::fmt;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&BASE64.encode(bytes))
        } else {
            serializer.serialize_bytes(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let encoded = Option::<String>::deserialize(deserializer)?;
            match encoded {
                Some(text) => BASE64.decode(text.as_bytes()).map_err(de::Error::custom),
                None => Ok(Vec::new()),
            }
        } else {
            deserializer.deserialize_byte_buf(BytesVisitor)
        }
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte string")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                out.push(byte);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_follows_first_byte() {
        assert_eq!(ContentType::infer(b"{}"), ContentType::Json);
        assert_eq!(ContentType::infer(b"["), ContentType::Json);
        assert_eq!(ContentType::infer(b"{"), ContentType::Json);
        assert_eq!(ContentType::infer(b"x"), ContentType::Cbor);
        assert_eq!(ContentType::infer(&[0xa1]), ContentType::Cbor);
        assert_eq!(ContentType::infer(b""), ContentType::Cbor);
    }

    #[test]
    fn content_type_string_conversions() {
        assert_eq!(ContentType::from("application/json"), ContentType::Json);
        assert_eq!(ContentType::from("Application/CBOR"), ContentType::Cbor);
        let other = ContentType::from("text/plain");
        assert_eq!(other, ContentType::Other("text/plain".into()));
        assert_eq!(String::from(other), "text/plain");
    }

    #[test]
    fn json_envelope_uses_edgex_field_names() {
        let envelope = Envelope::new("abc", b"OK".to_vec(), ContentType::Json);
        let json = serde_json::to_value(&envelope).expect("serialize json");
        assert_eq!(json["CorrelationID"], "abc");
        assert_eq!(json["Payload"], "T0s=");
        assert_eq!(json["ContentType"], "application/json");
        assert!(json.get("Checksum").is_none());
    }

    #[test]
    fn json_envelope_tolerates_null_payload_and_missing_fields() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"CorrelationID":"abc","Payload":null,"ApiVersion":"v3"}"#)
                .expect("deserialize json");
        assert_eq!(envelope.correlation_id, "abc");
        assert!(envelope.payload.is_empty());
        assert_eq!(envelope.content_type, ContentType::Json);
    }

    #[test]
    fn cbor_envelope_keeps_payload_as_bytes() {
        let envelope = Envelope::new("abc", vec![0u8, 1, 2, 255], ContentType::Cbor)
            .with_checksum("sum");
        let bytes = serde_cbor::to_vec(&envelope).expect("serialize cbor");
        let decoded: Envelope = serde_cbor::from_slice(&bytes).expect("deserialize cbor");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn metadata_value_defaults_to_empty() {
        let mut msg = TransportMessage::new("id", b"OK".to_vec());
        assert_eq!(msg.metadata_value(CORRELATION_ID_KEY), "");
        msg.set_metadata(CORRELATION_ID_KEY, "cid");
        assert_eq!(msg.metadata_value(CORRELATION_ID_KEY), "cid");
    }

    #[test]
    fn new_id_is_unique() {
        assert_ne!(new_id(), new_id());
        assert!(!new_id().is_empty());
    }
}
