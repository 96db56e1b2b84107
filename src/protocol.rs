use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::room::model::{ChatMessage, Command, PendingAction, RoomSnapshot};

/// One inbound frame. A frame carrying `id` expects an [`AckFrame`] with the
/// same `id`; frames without one are fire-and-forget.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub event: ClientEvent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "ntp:ping")]
    NtpPing { t0: f64 },
    #[serde(rename = "room:join")]
    RoomJoin {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "displayName")]
        display_name: Option<String>,
    },
    #[serde(rename = "room:state:request")]
    RoomStateRequest {},
    #[serde(rename = "room:command")]
    RoomCommand { command: Command },
    #[serde(rename = "chat:send")]
    ChatSend {
        message: String,
        #[serde(rename = "displayName")]
        display_name: Option<String>,
    },
    #[serde(rename = "stage:token")]
    StageToken {
        #[serde(rename = "displayName")]
        display_name: Option<String>,
        #[serde(rename = "tabId")]
        tab_id: Option<String>,
        #[serde(rename = "clientId")]
        client_id: Option<String>,
    },
    #[serde(rename = "table:token")]
    TableToken {
        #[serde(rename = "tableId")]
        table_id: String,
        #[serde(rename = "tabId")]
        tab_id: Option<String>,
        #[serde(rename = "clientId")]
        client_id: Option<String>,
    },
    #[serde(rename = "call:join")]
    CallJoin {},
    #[serde(rename = "call:leave")]
    CallLeave {},
    #[serde(rename = "call:presence:update")]
    CallPresenceUpdate {
        #[serde(default)]
        state: Value,
    },
    #[serde(rename = "call:signal")]
    CallSignal {
        #[serde(rename = "toUserId")]
        to_user_id: String,
        #[serde(default)]
        data: Value,
    },
}

/// Server push, fanned out through the room topic. Serialized shape is
/// `{event, data}`, the same envelope clients send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "presence:update")]
    PresenceUpdate {
        #[serde(rename = "roomId")]
        room_id: Uuid,
        #[serde(rename = "onlineCount")]
        online_count: i64,
    },
    #[serde(rename = "room:hand")]
    RoomHand {
        #[serde(rename = "roomId")]
        room_id: Uuid,
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "displayName")]
        display_name: Option<String>,
        #[serde(rename = "atMs")]
        at_ms: i64,
    },
    #[serde(rename = "room:action")]
    RoomAction {
        #[serde(rename = "roomId")]
        room_id: Uuid,
        action: PendingAction,
    },
    #[serde(rename = "chat:message")]
    Chat { message: ChatMessage },
    #[serde(rename = "call:presence")]
    CallPresence {
        #[serde(rename = "roomId")]
        room_id: Uuid,
        #[serde(rename = "userId")]
        user_id: String,
        kind: CallPresenceKind,
        #[serde(default)]
        state: Value,
    },
    #[serde(rename = "call:signal")]
    CallSignal {
        #[serde(rename = "fromUserId")]
        from_user_id: String,
        #[serde(rename = "toUserId")]
        to_user_id: String,
        #[serde(default)]
        data: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPresenceKind {
    Join,
    Leave,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    RateLimited,
    InvalidCommand,
    InvalidRoomId,
    InvalidMessage,
    NotInRoom,
    Forbidden,
    StageFull,
    TableFull,
    LivekitNotConfigured,
    NotConnected,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::InvalidCommand => "invalid_command",
            ErrorCode::InvalidRoomId => "invalid_room_id",
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::NotInRoom => "not_in_room",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::StageFull => "stage_full",
            ErrorCode::TableFull => "table_full",
            ErrorCode::LivekitNotConfigured => "livekit_not_configured",
            ErrorCode::NotConnected => "not_connected",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Successful ack payloads, flattened into the ack frame so the client sees
/// `{id, ok, ...fields}`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AckData {
    Pong {
        t0: f64,
        t1: i64,
        t2: i64,
    },
    RoomState {
        state: RoomSnapshot,
        pending: Vec<PendingAction>,
        #[serde(rename = "onlineCount")]
        online_count: i64,
        chat: Vec<ChatMessage>,
    },
    Action {
        action: PendingAction,
    },
    Chat {
        message: ChatMessage,
    },
    SfuToken {
        token: String,
        url: String,
        room: String,
    },
    Empty {},
}

#[derive(Debug, Clone, Serialize)]
pub struct AckFrame {
    pub id: u64,
    pub ok: bool,
    #[serde(flatten)]
    pub data: Option<AckData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<i64>,
}

impl AckFrame {
    pub fn ok(id: u64, data: AckData) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
            retry_after_ms: None,
        }
    }

    pub fn err(id: u64, error: ErrorCode, retry_after_ms: Option<i64>) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(error),
            retry_after_ms,
        }
    }
}

/// MessagePack needs map lengths up front, which rules out serde's flatten
/// on the direct path; acks are assembled as a JSON tree first and encoded
/// from that.
pub fn encode_ack(ack: &AckFrame) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    use serde::ser::Error;
    let value = serde_json::to_value(ack).map_err(rmp_serde::encode::Error::custom)?;
    rmp_serde::to_vec_named(&value)
}

pub fn encode_event(event: &ServerEvent) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(event)
}

pub fn decode_frame(bytes: &[u8]) -> Result<ClientFrame, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::model::PlaybackState;
    use serde_json::json;

    fn roundtrip(frame: serde_json::Value) -> ClientFrame {
        let bytes = rmp_serde::to_vec_named(&frame).unwrap();
        decode_frame(&bytes).unwrap()
    }

    #[test]
    fn decodes_a_command_frame() {
        let frame = roundtrip(json!({
            "id": 7,
            "event": "room:command",
            "data": {"command": {"type": "video:seek", "positionSeconds": 120.0}}
        }));
        assert_eq!(frame.id, Some(7));
        match frame.event {
            ClientEvent::RoomCommand {
                command: Command::VideoSeek { position_seconds },
            } => assert_eq!(position_seconds, 120.0),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decodes_fire_and_forget_frames_without_id() {
        let frame = roundtrip(json!({
            "event": "room:join",
            "data": {"roomId": "not-checked-here", "displayName": "Ada"}
        }));
        assert_eq!(frame.id, None);
        assert!(matches!(frame.event, ClientEvent::RoomJoin { .. }));
    }

    #[test]
    fn unit_style_commands_decode_from_type_tag_alone() {
        let frame = roundtrip(json!({
            "id": 1,
            "event": "room:command",
            "data": {"command": {"type": "video:play"}}
        }));
        assert!(matches!(
            frame.event,
            ClientEvent::RoomCommand {
                command: Command::VideoPlay
            }
        ));
    }

    #[test]
    fn ack_frames_flatten_their_payload() {
        let ack = AckFrame::ok(
            3,
            AckData::Pong {
                t0: 1.5,
                t1: 10,
                t2: 11,
            },
        );
        let as_json = serde_json::to_value(&ack).unwrap();
        assert_eq!(as_json["id"], 3);
        assert_eq!(as_json["ok"], true);
        assert_eq!(as_json["t1"], 10);
        assert!(as_json.get("error").is_none());
    }

    #[test]
    fn acks_encode_to_messagepack_with_flat_fields() {
        let ack = AckFrame::ok(
            5,
            AckData::Pong {
                t0: 1.0,
                t1: 2,
                t2: 3,
            },
        );
        let bytes = encode_ack(&ack).unwrap();
        let value: serde_json::Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(value["id"], 5);
        assert_eq!(value["ok"], true);
        assert_eq!(value["t2"], 3);
    }

    #[test]
    fn error_acks_carry_code_and_retry_delay() {
        let ack = AckFrame::err(9, ErrorCode::RateLimited, Some(450));
        let as_json = serde_json::to_value(&ack).unwrap();
        assert_eq!(as_json["ok"], false);
        assert_eq!(as_json["error"], "rate_limited");
        assert_eq!(as_json["retryAfterMs"], 450);
    }

    #[test]
    fn server_events_roundtrip_through_the_topic_envelope() {
        let room_id = Uuid::new_v4();
        let snapshot = RoomSnapshot {
            room_id,
            name: "movie night".into(),
            video_id: Some("abc12345678".into()),
            playback_state: PlaybackState::Playing,
            video_time_at_ref: 12.0,
            reference_time_ms: 5_000,
            playback_rate: 1.0,
            seq: 4,
            controller_user_id: None,
            audience_delay_seconds: 0.0,
            created_by: Some("host".into()),
        };
        let event = ServerEvent::RoomAction {
            room_id,
            action: PendingAction {
                seq: 4,
                exec_at_ms: 7_500,
                server_now_ms: 5_000,
                command: Command::VideoPlay,
                patch: snapshot,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: ServerEvent = serde_json::from_str(&json).unwrap();
        match back {
            ServerEvent::RoomAction { action, .. } => {
                assert_eq!(action.seq, 4);
                assert_eq!(action.exec_at_ms, 7_500);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
