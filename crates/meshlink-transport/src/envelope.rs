//! Wire envelope exchanged with the streaming server
//!
//! Every frame on the socket is a single CBOR-encoded [`Envelope`]. The
//! envelope carries a message type tag, the session it belongs to and an
//! opaque payload which is itself CBOR for the typed payloads below.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use meshlink_core::{CompressedMeshData, CompressionLevel, MeshId, PoseData};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("CBOR encoding failed: {0}")]
    Encode(#[source] serde_cbor::Error),
    #[error("CBOR decoding failed: {0}")]
    Decode(#[source] serde_cbor::Error),
    #[error("Envelope of type {0} has no payload")]
    MissingPayload(String),
}

/// Message type tags
pub mod message_type {
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";
    pub const ANCHOR_UPDATE: &str = "anchor_update";
    pub const MESH_UPDATE: &str = "mesh_update";
    pub const ACK: &str = "ack";
}

/// Parsed message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    Error,
    AnchorUpdate,
    MeshUpdate,
    Ack,
    Unknown,
}

impl MessageKind {
    pub fn parse(tag: &str) -> Self {
        match tag {
            message_type::PING => MessageKind::Ping,
            message_type::PONG => MessageKind::Pong,
            message_type::ERROR => MessageKind::Error,
            message_type::ANCHOR_UPDATE => MessageKind::AnchorUpdate,
            message_type::MESH_UPDATE => MessageKind::MeshUpdate,
            message_type::ACK => MessageKind::Ack,
            _ => MessageKind::Unknown,
        }
    }

    /// Kinds handed to subscribers as application messages
    pub fn is_forwarded(self) -> bool {
        matches!(
            self,
            MessageKind::AnchorUpdate | MessageKind::MeshUpdate | MessageKind::Ack
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Envelope {
    pub fn new(message_type: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            message_type: message_type.into(),
            session_id,
            payload: None,
            timestamp: Utc::now().timestamp_millis(),
            trace_id: None,
        }
    }

    pub fn ping(session_id: Option<String>) -> Self {
        Self::new(message_type::PING, session_id)
    }

    /// Envelope carrying a CBOR-encoded payload
    pub fn with_payload<T: Serialize>(
        message_type: impl Into<String>,
        session_id: Option<String>,
        payload: &T,
    ) -> Result<Self, EnvelopeError> {
        let bytes = serde_cbor::to_vec(payload).map_err(EnvelopeError::Encode)?;
        let mut envelope = Self::new(message_type, session_id);
        envelope.payload = Some(bytes);
        Ok(envelope)
    }

    pub fn anchor_update(
        session_id: Option<String>,
        update: &AnchorUpdate,
    ) -> Result<Self, EnvelopeError> {
        Self::with_payload(message_type::ANCHOR_UPDATE, session_id, update)
    }

    pub fn mesh_update(
        session_id: Option<String>,
        update: &MeshUpdate,
    ) -> Result<Self, EnvelopeError> {
        Self::with_payload(message_type::MESH_UPDATE, session_id, update)
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::parse(&self.message_type)
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_cbor::to_vec(self).map_err(EnvelopeError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_cbor::from_slice(bytes).map_err(EnvelopeError::Decode)
    }

    /// Decode the payload as `T`
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        let bytes = self
            .payload
            .as_deref()
            .ok_or_else(|| EnvelopeError::MissingPayload(self.message_type.clone()))?;
        serde_cbor::from_slice(bytes).map_err(EnvelopeError::Decode)
    }
}

/// Pose update for a tracked anchor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorUpdate {
    pub anchor_id: String,
    pub pose: PoseData,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Compressed mesh snapshot or delta for an anchor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshUpdate {
    pub mesh_id: String,
    pub anchor_id: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub normals: Option<Vec<u8>>,
    pub compression_level: u32,
    pub is_delta: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_mesh_id: Option<String>,
}

impl MeshUpdate {
    pub fn from_compressed(anchor_id: impl Into<String>, compressed: &CompressedMeshData) -> Self {
        Self {
            mesh_id: compressed.mesh_id.to_string(),
            anchor_id: anchor_id.into(),
            data: compressed.data.clone(),
            normals: compressed.normals.clone(),
            compression_level: compressed.level.level(),
            is_delta: compressed.is_delta(),
            base_mesh_id: compressed.base_mesh_id.as_ref().map(ToString::to_string),
        }
    }

    /// Rebuild the codec view of a received update. Sizes are the
    /// compressed sizes since the original size does not travel.
    pub fn to_compressed(&self, timestamp: DateTime<Utc>) -> CompressedMeshData {
        let size = self.data.len() + self.normals.as_ref().map_or(0, Vec::len);
        CompressedMeshData {
            mesh_id: MeshId::from(self.mesh_id.as_str()),
            base_mesh_id: if self.is_delta {
                self.base_mesh_id.as_deref().map(MeshId::from)
            } else {
                None
            },
            data: self.data.clone(),
            normals: self.normals.clone(),
            level: CompressionLevel::from_level(self.compression_level),
            timestamp,
            original_size: size,
            compressed_size: size,
        }
    }
}

/// Body of a server `error` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_core::{MeshCodec, MeshData};

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = Envelope::with_payload(
            message_type::ERROR,
            Some("session-1".into()),
            &ErrorPayload {
                message: "quota exceeded".into(),
                code: Some("429".into()),
            },
        )
        .unwrap()
        .with_trace_id("trace-7");

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.kind(), MessageKind::Error);
        let payload: ErrorPayload = decoded.payload_as().unwrap();
        assert_eq!(payload.message, "quota exceeded");
    }

    #[test]
    fn test_type_field_is_named_type() {
        let bytes = Envelope::ping(None).encode().unwrap();
        let value: serde_cbor::Value = serde_cbor::from_slice(&bytes).unwrap();
        let serde_cbor::Value::Map(map) = value else {
            panic!("envelope is not a map");
        };
        let tag = map.get(&serde_cbor::Value::Text("type".into()));
        assert_eq!(tag, Some(&serde_cbor::Value::Text("ping".into())));
        assert!(!map.contains_key(&serde_cbor::Value::Text("payload".into())));
    }

    #[test]
    fn test_payload_is_byte_string() {
        let mut envelope = Envelope::new(message_type::ACK, None);
        envelope.payload = Some(vec![1, 2, 3]);
        let value: serde_cbor::Value = serde_cbor::from_slice(&envelope.encode().unwrap()).unwrap();
        let serde_cbor::Value::Map(map) = value else {
            panic!("envelope is not a map");
        };
        assert_eq!(
            map.get(&serde_cbor::Value::Text("payload".into())),
            Some(&serde_cbor::Value::Bytes(vec![1, 2, 3]))
        );
    }

    #[test]
    fn test_message_kind() {
        assert_eq!(MessageKind::parse("mesh_update"), MessageKind::MeshUpdate);
        assert_eq!(MessageKind::parse("telemetry"), MessageKind::Unknown);
        assert!(MessageKind::Ack.is_forwarded());
        assert!(MessageKind::AnchorUpdate.is_forwarded());
        assert!(!MessageKind::Pong.is_forwarded());
        assert!(!MessageKind::Error.is_forwarded());
    }

    #[test]
    fn test_missing_payload() {
        let envelope = Envelope::new(message_type::MESH_UPDATE, None);
        assert!(matches!(
            envelope.payload_as::<MeshUpdate>(),
            Err(EnvelopeError::MissingPayload(_))
        ));
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(matches!(
            Envelope::decode(&[0xff, 0x00, 0x13]),
            Err(EnvelopeError::Decode(_))
        ));
    }

    #[test]
    fn test_mesh_update_from_compressed() {
        let codec = MeshCodec::default();
        let mesh = MeshData::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            vec![0, 1, 2],
        )
        .with_id("mesh-a");
        let compressed = codec.encode_full(&mesh, CompressionLevel::High).unwrap();

        let update = MeshUpdate::from_compressed("anchor-1", &compressed);
        assert_eq!(update.mesh_id, "mesh-a");
        assert_eq!(update.compression_level, 7);
        assert!(!update.is_delta);

        let envelope = Envelope::mesh_update(Some("s".into()), &update).unwrap();
        let received: MeshUpdate = Envelope::decode(&envelope.encode().unwrap())
            .unwrap()
            .payload_as()
            .unwrap();
        let decoded = codec
            .decode(&received.to_compressed(compressed.timestamp))
            .unwrap();
        assert_eq!(decoded.vertices, mesh.vertices);
        assert_eq!(decoded.faces, mesh.faces);
    }

    #[test]
    fn test_anchor_update_roundtrip() {
        let mut metadata = HashMap::new();
        metadata.insert("plane".to_string(), "floor".to_string());
        let update = AnchorUpdate {
            anchor_id: "anchor-9".into(),
            pose: PoseData::new([1.0, 2.0, 3.0], [0.0, 0.0, 0.0, 1.0]),
            metadata,
        };
        let envelope = Envelope::anchor_update(None, &update).unwrap();
        let decoded: AnchorUpdate = Envelope::decode(&envelope.encode().unwrap())
            .unwrap()
            .payload_as()
            .unwrap();
        assert_eq!(decoded, update);
    }
}
