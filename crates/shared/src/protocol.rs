//! Push-channel protocol definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Well-known topics emitted by the server collaborators.
pub mod topics {
    pub const DOCUMENT_LIFECYCLE: &str = "document.lifecycle";
    pub const SECTION_STREAM: &str = "section.stream";
    pub const QUALITY_GATE: &str = "quality-gate.progress";
    pub const REVIEW_ACTIVITY: &str = "review.activity";
}

/// Whether an envelope carries data or only proves the channel is alive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Event,
    Heartbeat,
}

/// One structured server-pushed message.
///
/// Envelopes are immutable once decoded: listeners only ever see a shared
/// reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: String,
    pub topic: String,
    /// Target resource, absent for workspace-wide events.
    #[serde(default)]
    pub resource_id: Option<String>,
    pub workspace_id: String,
    pub sequence: u64,
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Opaque resume token echoed back by the server.
    #[serde(default)]
    pub last_event_id: Option<String>,
}

impl EventEnvelope {
    /// Decode a text frame received on the push channel.
    pub fn from_json(frame: &str) -> Result<Self, ProtocolError> {
        let envelope: EventEnvelope = serde_json::from_str(frame)?;
        if envelope.topic.trim().is_empty() {
            return Err(ProtocolError::EmptyTopic { id: envelope.id });
        }
        Ok(envelope)
    }

    /// Serialize for the wire (used by test fixtures and the tail CLI).
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == EnvelopeKind::Heartbeat
    }

    /// Token to hand back to the server when reconnecting. Prefers the
    /// server-provided `lastEventId`, falling back to the envelope id.
    pub fn resume_token(&self) -> &str {
        self.last_event_id.as_deref().unwrap_or(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: &str = r#"{
        "id": "evt-7",
        "topic": "section.stream",
        "resourceId": "sec-1",
        "workspaceId": "ws-1",
        "sequence": 7,
        "kind": "event",
        "payload": {"delta": "Hello"},
        "emittedAt": "2026-10-16T12:00:00Z",
        "metadata": {},
        "lastEventId": "cursor-7"
    }"#;

    #[test]
    fn decodes_camel_case_frame() {
        let envelope = EventEnvelope::from_json(FRAME).unwrap();
        assert_eq!(envelope.topic, topics::SECTION_STREAM);
        assert_eq!(envelope.resource_id.as_deref(), Some("sec-1"));
        assert_eq!(envelope.sequence, 7);
        assert_eq!(envelope.kind, EnvelopeKind::Event);
        assert_eq!(envelope.payload["delta"], "Hello");
        assert_eq!(envelope.resume_token(), "cursor-7");
    }

    #[test]
    fn heartbeat_without_optional_fields() {
        let frame = r#"{"id":"hb-1","topic":"system","workspaceId":"ws-1","sequence":0,
            "kind":"heartbeat","emittedAt":"2026-10-16T12:00:00Z"}"#;
        let envelope = EventEnvelope::from_json(frame).unwrap();
        assert!(envelope.is_heartbeat());
        assert!(envelope.resource_id.is_none());
        assert!(envelope.payload.is_null());
        assert_eq!(envelope.resume_token(), "hb-1");
    }

    #[test]
    fn rejects_garbage_and_empty_topic() {
        let err = EventEnvelope::from_json("not json").unwrap_err();
        assert_eq!(err.kind(), "malformed");

        let frame = FRAME.replace("section.stream", " ");
        let err = EventEnvelope::from_json(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyTopic { ref id } if id == "evt-7"));
    }

    #[test]
    fn wire_names_are_camel_case() {
        let envelope = EventEnvelope::from_json(FRAME).unwrap();
        let json = envelope.to_json().unwrap();
        assert!(json.contains("\"resourceId\":\"sec-1\""));
        assert!(json.contains("\"workspaceId\":\"ws-1\""));
        assert!(json.contains("\"kind\":\"event\""));
    }
}
