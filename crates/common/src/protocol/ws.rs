// WebSocket frame types for the scenesync-sync.v1 protocol.
//
// Every frame is a JSON object tagged by `type`. Binary CRDT payloads
// (state vectors and updates) travel base64-encoded.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Close codes sent by the server when it terminates a connection.
pub mod close_code {
    /// The room could not be joined (initial load failed irrecoverably).
    pub const ROOM_JOIN_FAILED: u16 = 4000;
    /// The connection could not drain its outbound queue fast enough.
    pub const SLOW_CONSUMER: u16 = 4008;
    /// The server is shutting down.
    pub const GOING_AWAY: u16 = 1001;
    /// A frame exceeded the maximum size.
    pub const TOO_LARGE: u16 = 1009;
    /// Unexpected server-side failure.
    pub const INTERNAL: u16 = 1011;
}

/// Error codes carried by [`WsMessage::Error`] frames.
pub mod error_code {
    pub const INVALID_FRAME: &str = "SYNC_INVALID_FRAME";
    pub const INVALID_PAYLOAD: &str = "SYNC_INVALID_PAYLOAD";
    pub const INVALID_UPDATE: &str = "SYNC_INVALID_UPDATE";
    pub const UNSUPPORTED_MESSAGE: &str = "SYNC_UNSUPPORTED_MESSAGE";
}

/// Presence as broadcast to peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerPresence {
    pub connection_id: Uuid,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Client-defined awareness payload (cursor, selection, ...).
    #[serde(default)]
    pub state: serde_json::Value,
}

/// All frames of the scenesync-sync.v1 protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Server -> Client: sent once after the room admitted the connection.
    Welcome { room_id: String, connection_id: Uuid, user_id: String },

    /// Bidirectional: the sender's state vector. The receiver answers with
    /// a `sync_step2` carrying everything the sender is missing.
    SyncStep1 { state_vector: String },

    /// Bidirectional: a diff (or full state) answering a `sync_step1`.
    SyncStep2 { update: String },

    /// Bidirectional: an incremental CRDT update.
    Update { update: String },

    /// Client -> Server: replace this connection's awareness state.
    Awareness { state: serde_json::Value },

    /// Server -> Client: presence of one or more peers (full table on join,
    /// single entries afterwards).
    Presence { peers: Vec<PeerPresence> },

    /// Server -> Client: a peer left the room.
    PresenceRemoved { connection_id: Uuid },

    /// Server -> Client: a frame was rejected. The connection stays open.
    Error { code: String, message: String, retryable: bool },
}

impl WsMessage {
    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::SyncStep1 { .. } => "sync_step1",
            Self::SyncStep2 { .. } => "sync_step2",
            Self::Update { .. } => "update",
            Self::Awareness { .. } => "awareness",
            Self::Presence { .. } => "presence",
            Self::PresenceRemoved { .. } => "presence_removed",
            Self::Error { .. } => "error",
        }
    }

    pub fn error(code: &str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Error { code: code.to_string(), message: message.into(), retryable }
    }
}

pub fn decode_message(raw: &str) -> Result<WsMessage, serde_json::Error> {
    serde_json::from_str::<WsMessage>(raw)
}

pub fn encode_message(message: &WsMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

#[derive(Debug, Error)]
#[error("invalid base64 payload: {0}")]
pub struct PayloadError(#[from] base64::DecodeError);

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, PayloadError> {
    Ok(STANDARD.decode(encoded)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_tagged_with_snake_case_type() {
        let frame = WsMessage::SyncStep1 { state_vector: "AA==".to_string() };
        let value = serde_json::to_value(&frame).expect("frame should serialize");
        assert_eq!(value["type"], "sync_step1");
        assert_eq!(value["state_vector"], "AA==");
    }

    #[test]
    fn decode_rejects_unknown_type() {
        assert!(decode_message(r#"{"type":"subscribe","doc_id":"x"}"#).is_err());
    }

    #[test]
    fn awareness_frame_accepts_arbitrary_state() {
        let frame = decode_message(r#"{"type":"awareness","state":{"cursor":{"x":1,"y":2}}}"#)
            .expect("awareness frame should decode");
        match frame {
            WsMessage::Awareness { state } => assert_eq!(state["cursor"]["y"], 2),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn peer_presence_omits_missing_name_and_color() {
        let peer = PeerPresence {
            connection_id: Uuid::nil(),
            user_id: "u-1".to_string(),
            name: None,
            color: None,
            state: serde_json::Value::Null,
        };
        let value = serde_json::to_value(peer).expect("peer should serialize");
        assert!(value.get("name").is_none());
        assert!(value.get("color").is_none());
    }

    #[test]
    fn payload_decode_reports_bad_base64() {
        assert_eq!(decode_payload(&encode_payload(&[1, 2, 3])).expect("valid"), vec![1, 2, 3]);
        assert!(decode_payload("not base64!").is_err());
    }
}
