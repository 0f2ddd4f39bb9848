use crate::value_objects::{MessageId, RoomId, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    System,
    Notification,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: String,
    pub content: String,
    pub timestamp: Timestamp,
    pub kind: MessageKind,
    pub edited: bool,
    pub edited_at: Option<Timestamp>,
}

impl Message {
    pub fn new_user(
        id: MessageId,
        room_id: RoomId,
        user_id: UserId,
        username: impl Into<String>,
        content: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            room_id,
            user_id,
            username: username.into(),
            content: content.into(),
            timestamp,
            kind: MessageKind::User,
            edited: false,
            edited_at: None,
        }
    }

    /// 服务端合成的消息；`kind` 决定是否持久化。
    pub fn synthetic(
        room_id: RoomId,
        content: impl Into<String>,
        kind: MessageKind,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: MessageId::random(),
            room_id,
            user_id: UserId::system(),
            username: "System".to_owned(),
            content: content.into(),
            timestamp,
            kind,
            edited: false,
            edited_at: None,
        }
    }

    pub fn apply_edit(&mut self, content: impl Into<String>, at: Timestamp) {
        self.content = content.into();
        self.edited = true;
        self.edited_at = Some(at);
    }
}
