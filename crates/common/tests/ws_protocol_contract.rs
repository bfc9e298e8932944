use scenesync_common::protocol::ws::{close_code, PeerPresence, WsMessage};
use scenesync_common::protocol::PROTOCOL_VERSION;
use serde_json::Value;
use uuid::Uuid;

#[test]
fn protocol_version_is_scenesync_sync_v1() {
    assert_eq!(PROTOCOL_VERSION, "scenesync-sync.v1");
}

#[test]
fn websocket_contract_message_shapes() {
    let connection_id = Uuid::new_v4();

    let samples = [
        (
            WsMessage::Welcome {
                room_id: "site:v1".to_string(),
                connection_id,
                user_id: "user-1".to_string(),
            },
            "welcome",
            &["type", "room_id", "connection_id", "user_id"][..],
        ),
        (
            WsMessage::SyncStep1 { state_vector: "AA==".to_string() },
            "sync_step1",
            &["type", "state_vector"][..],
        ),
        (WsMessage::SyncStep2 { update: "AAA=".to_string() }, "sync_step2", &["type", "update"][..]),
        (WsMessage::Update { update: "AQID".to_string() }, "update", &["type", "update"][..]),
        (
            WsMessage::Awareness { state: serde_json::json!({ "cursor": [1, 2] }) },
            "awareness",
            &["type", "state"][..],
        ),
        (
            WsMessage::Presence {
                peers: vec![PeerPresence {
                    connection_id,
                    user_id: "user-1".to_string(),
                    name: Some("Ada".to_string()),
                    color: Some("#ff8800".to_string()),
                    state: Value::Null,
                }],
            },
            "presence",
            &["type", "peers"][..],
        ),
        (WsMessage::PresenceRemoved { connection_id }, "presence_removed", &["type", "connection_id"][..]),
        (
            WsMessage::error("SYNC_INVALID_FRAME", "invalid frame", false),
            "error",
            &["type", "code", "message", "retryable"][..],
        ),
    ];

    for (message, expected_type, expected_keys) in samples {
        assert_eq!(message.kind(), expected_type);
        let value = serde_json::to_value(message).expect("ws message should serialize");
        assert_eq!(value["type"], expected_type);
        for key in expected_keys {
            assert!(
                value.get(key).is_some(),
                "serialized `{expected_type}` frame must include `{key}`",
            );
        }
    }
}

#[test]
fn room_join_failure_has_dedicated_close_code() {
    assert_eq!(close_code::ROOM_JOIN_FAILED, 4000);
    assert_ne!(close_code::ROOM_JOIN_FAILED, close_code::INTERNAL);
    assert_ne!(close_code::SLOW_CONSUMER, close_code::ROOM_JOIN_FAILED);
}
