//! Wire protocols.
//!
//! Relay frames travel between nodes and the relay server (bincode-encoded
//! envelope, JSON change event in the payload):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────────────────────────┐
//! │ msg_type │ channel   │ seq      │ payload                      │
//! │ 1 byte   │ string    │ 8 bytes  │ JSON ChangeEvent (w/ origin) │
//! └──────────┴───────────┴──────────┴──────────────────────────────┘
//! ```
//!
//! Live frames travel between a node and its clients as JSON text:
//! ```text
//! client → node   {"request_id":1,"op":"patch","id":7,"data":{"title":"B"}}
//! node → client   {"type":"response","request_id":1,"body":{"status":"record","record":{...}}}
//! node → client   {"type":"change","kind":"Updated","record":{...}}
//! ```
//! Change frames sent to clients never carry the origin node.

use livegrid_core::{ChangeEvent, ChangeKind, NodeIdentity, Record, RecordData, RecordId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::Page;

/// Relay message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RelayMessageType {
    /// Start receiving notifications on a channel
    Listen = 1,
    /// Stop receiving notifications on a channel
    Unlisten = 2,
    /// Change event published on a channel
    Notify = 3,
    /// Heartbeat ping
    Ping = 4,
    /// Heartbeat pong
    Pong = 5,
}

/// Envelope exchanged with the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayFrame {
    pub msg_type: RelayMessageType,
    pub channel: String,
    /// Per-publisher sequence number, for diagnostics only
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl RelayFrame {
    fn control(msg_type: RelayMessageType, channel: &str) -> Self {
        Self {
            msg_type,
            channel: channel.to_string(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    pub fn listen(channel: &str) -> Self {
        Self::control(RelayMessageType::Listen, channel)
    }

    pub fn unlisten(channel: &str) -> Self {
        Self::control(RelayMessageType::Unlisten, channel)
    }

    pub fn ping() -> Self {
        Self::control(RelayMessageType::Ping, "")
    }

    pub fn pong() -> Self {
        Self::control(RelayMessageType::Pong, "")
    }

    /// Wrap a change event (origin included) for publication.
    pub fn notify(channel: &str, seq: u64, event: &ChangeEvent) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: RelayMessageType::Notify,
            channel: channel.to_string(),
            seq,
            payload,
        })
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }

    /// Parse the change event carried by a `Notify` frame.
    pub fn change_event(&self) -> Result<ChangeEvent, ProtocolError> {
        if self.msg_type != RelayMessageType::Notify {
            return Err(ProtocolError::InvalidMessageType);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Origin of a `Notify` frame, if decodable.
    pub fn origin(&self) -> Option<NodeIdentity> {
        self.change_event().ok().map(|event| event.origin)
    }
}

/// A client request sent over the live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub request_id: u64,
    #[serde(flatten)]
    pub op: RequestOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RequestOp {
    Create {
        data: RecordData,
    },
    Patch {
        id: RecordId,
        data: RecordData,
    },
    Page {
        #[serde(default)]
        cursor: Option<RecordId>,
        #[serde(default)]
        limit: Option<i64>,
    },
    Ping,
}

impl ClientRequest {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// A change as seen by live subscribers: no origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotice {
    pub kind: ChangeKind,
    pub record: Record,
}

impl From<&ChangeEvent> for ChangeNotice {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            kind: event.kind,
            record: event.record.clone(),
        }
    }
}

/// Result of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseBody {
    Record { record: Record },
    Page { page: Page },
    NotFound { id: RecordId },
    Error { message: String },
    Pong,
}

/// Frames sent from a node to a live client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Change(ChangeNotice),
    Response { request_id: u64, body: ResponseBody },
}

impl ServerMessage {
    pub fn change(event: &ChangeEvent) -> Self {
        ServerMessage::Change(ChangeNotice::from(event))
    }

    pub fn response(request_id: u64, body: ResponseBody) -> Self {
        ServerMessage::Response { request_id, body }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type")]
    InvalidMessageType,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Value};

    fn sample_event() -> ChangeEvent {
        let data = json!({"title": "A", "tags": ["x", "y"]}).as_object().cloned().unwrap();
        ChangeEvent::updated(Record::new_created(7, data, Utc::now()), NodeIdentity::new("node-a"))
    }

    #[test]
    fn test_notify_frame_carries_event_and_origin() {
        let event = sample_event();
        let frame = RelayFrame::notify("items", 3, &event).unwrap();
        let decoded = RelayFrame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, RelayMessageType::Notify);
        assert_eq!(decoded.channel, "items");
        assert_eq!(decoded.seq, 3);
        assert_eq!(decoded.change_event().unwrap(), event);
        assert_eq!(decoded.origin(), Some(NodeIdentity::new("node-a")));
    }

    #[test]
    fn test_control_frames_have_no_event() {
        let frame = RelayFrame::listen("items");
        let decoded = RelayFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, RelayMessageType::Listen);
        assert_eq!(decoded.change_event(), Err(ProtocolError::InvalidMessageType));
        assert!(decoded.origin().is_none());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(RelayFrame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_notify_with_garbage_payload() {
        let frame = RelayFrame {
            msg_type: RelayMessageType::Notify,
            channel: "items".into(),
            seq: 0,
            payload: b"not json".to_vec(),
        };
        assert!(matches!(
            frame.change_event(),
            Err(ProtocolError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_change_frame_strips_origin() {
        let text = ServerMessage::change(&sample_event()).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["type"], json!("change"));
        assert_eq!(value["kind"], json!("Updated"));
        assert_eq!(value["record"]["id"], json!(7));
        assert!(value.get("origin").is_none());
    }

    #[test]
    fn test_request_parsing() {
        let patch = ClientRequest::decode(
            r#"{"request_id":4,"op":"patch","id":7,"data":{"title":"B"}}"#,
        )
        .unwrap();
        assert_eq!(patch.request_id, 4);
        match patch.op {
            RequestOp::Patch { id, data } => {
                assert_eq!(id, 7);
                assert_eq!(data["title"], json!("B"));
            }
            other => panic!("Expected patch, got {other:?}"),
        }

        let page = ClientRequest::decode(r#"{"request_id":5,"op":"page"}"#).unwrap();
        assert_eq!(page.op, RequestOp::Page { cursor: None, limit: None });

        assert!(ClientRequest::decode(r#"{"request_id":6,"op":"drop_table"}"#).is_err());
    }

    #[test]
    fn test_response_roundtrip() {
        let msg = ServerMessage::response(9, ResponseBody::NotFound { id: 12 });
        let text = msg.encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["body"]["status"], json!("not_found"));
        assert_eq!(ServerMessage::decode(&text).unwrap(), msg);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(RelayMessageType::Listen as u8, 1);
        assert_eq!(RelayMessageType::Unlisten as u8, 2);
        assert_eq!(RelayMessageType::Notify as u8, 3);
        assert_eq!(RelayMessageType::Ping as u8, 4);
        assert_eq!(RelayMessageType::Pong as u8, 5);
    }
}
