//! 线上协议
//!
//! JSON 文本帧，`type` 为判别字段；载荷字段一律 camelCase。
//! 服务端帧在发送时统一补上 ISO-8601 的 `timestamp`。
//! 未知的 `type` 在反序列化时直接失败，由路由回 INVALID_MESSAGE。

use domain::{ErrorCode, Message, MessageKind, Timestamp, User};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 单帧上限；超限属于协议不可用，直接断开。
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// 客户端 → 服务端
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Auth {
        username: String,
    },
    CreateRoom {
        room_name: String,
    },
    JoinRoom {
        room_name: String,
    },
    LeaveRoom,
    SendMessage {
        content: String,
    },
    TypingStart,
    TypingStop,
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl ClientFrame {
    /// 指标用的帧类型名。
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Auth { .. } => "auth",
            ClientFrame::CreateRoom { .. } => "create_room",
            ClientFrame::JoinRoom { .. } => "join_room",
            ClientFrame::LeaveRoom => "leave_room",
            ClientFrame::SendMessage { .. } => "send_message",
            ClientFrame::TypingStart => "typing_start",
            ClientFrame::TypingStop => "typing_stop",
            ClientFrame::Command { .. } => "command",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub user_id: String,
    pub username: String,
}

impl From<&User> for UserRef {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id.to_string(),
            username: user.username.as_str().to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedRoomRef {
    pub id: String,
    pub name: String,
    pub member_count: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub name: String,
    pub users: u32,
    pub messages: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
}

/// 消息在线上的形态；系统消息的 `userId` 固定为 "system"。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub username: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: Timestamp,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub edited: bool,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.to_string(),
            room_id: message.room_id.to_string(),
            user_id: if message.user_id.is_system() {
                "system".to_owned()
            } else {
                message.user_id.to_string()
            },
            username: message.username.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
            kind: message.kind,
            edited: message.edited,
        }
    }
}

/// 错误载荷；`correlation_id` 把错误帧和触发它的请求关联起来。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            correlation_id: Uuid::new_v4().to_string(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

/// 服务端 → 客户端
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    System {
        message: String,
    },
    AuthSuccess {
        user: UserRef,
    },
    AuthError {
        error: ErrorBody,
    },
    RoomCreated {
        room: RoomRef,
    },
    RoomJoined {
        room: JoinedRoomRef,
        members: Vec<String>,
    },
    RoomLeft {
        room_name: String,
    },
    Message {
        message: WireMessage,
    },
    MessageHistory {
        messages: Vec<WireMessage>,
    },
    UserJoined {
        user: UserRef,
        member_count: u32,
    },
    UserLeft {
        user: UserRef,
        member_count: u32,
    },
    TypingUpdate {
        typing_users: Vec<String>,
    },
    MessageEdited {
        message: WireMessage,
    },
    MessageDeleted {
        room_id: String,
        message_id: String,
    },
    RoomList {
        rooms: Vec<RoomSummary>,
        count: usize,
    },
    UserList {
        #[serde(skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        users: Vec<String>,
        count: usize,
    },
    Error {
        error: ErrorBody,
    },
    Notification {
        message: WireMessage,
    },
    #[serde(rename = "CLEAR_SCREEN")]
    ClearScreen,
}

impl ServerFrame {
    pub fn error(body: ErrorBody) -> Self {
        ServerFrame::Error { error: body }
    }

    /// 序列化为线上文本，补上服务端时间戳。
    pub fn to_wire(&self, now: Timestamp) -> String {
        let mut value = match serde_json::to_value(self) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "server frame serialization failed");
                serde_json::json!({
                    "type": "error",
                    "error": { "code": "INTERNAL_ERROR", "message": "frame serialization failed" },
                })
            }
        };
        if let serde_json::Value::Object(ref mut map) = value {
            let stamp = now
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default();
            map.insert("timestamp".to_owned(), serde_json::Value::String(stamp));
        }
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_decode_with_camel_case_fields() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"join_room","roomName":"lobby"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::JoinRoom { room_name } if room_name == "lobby"));

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"command","command":"rooms","args":["5"]}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Command { ref command, .. } if command == "rooms"));
    }

    #[test]
    fn unknown_type_fails_to_decode() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"mystery"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>("not json at all").is_err());
    }

    #[test]
    fn server_frames_carry_type_and_timestamp() {
        let wire = ServerFrame::System {
            message: "welcome".to_owned(),
        }
        .to_wire(Timestamp::UNIX_EPOCH);
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["type"], "system");
        assert_eq!(value["timestamp"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn clear_screen_uses_legacy_uppercase_tag() {
        let wire = ServerFrame::ClearScreen.to_wire(Timestamp::UNIX_EPOCH);
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["type"], "CLEAR_SCREEN");
    }

    #[test]
    fn error_body_serializes_camel_case() {
        let frame = ServerFrame::error(
            ErrorBody::new(ErrorCode::RateLimit, "slow down").with_retry_after(60),
        );
        let value: serde_json::Value = serde_json::from_str(&frame.to_wire(Timestamp::UNIX_EPOCH)).unwrap();
        assert_eq!(value["error"]["code"], "RATE_LIMIT");
        assert_eq!(value["error"]["retryAfter"], 60);
        assert!(value["error"]["correlationId"].is_string());
    }
}
