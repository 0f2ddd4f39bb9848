//! 跨进程发布/订阅平面
//!
//! 总线是一个接口、两种实现：共享（Redis）与进程内广播，启动时二选一。
//! 核心逻辑永远面向 trait，总线缺席只是换一种实现，不是一个分支。

use async_trait::async_trait;
use domain::{Message, MessageId, RoomId, UserId};
use thiserror::Error;
use tokio::sync::mpsc;

/// 频道命名约定；房间频道以 `roomId` 为规范键。
pub mod channels {
    use domain::RoomId;

    pub const GLOBAL_BROADCAST: &str = "global:broadcast";
    pub const ROOM_CREATED: &str = "room:created";

    pub fn room_messages(room_id: RoomId) -> String {
        format!("room:{room_id}:messages")
    }

    pub fn room_events(room_id: RoomId) -> String {
        format!("room:{room_id}:events")
    }
}

/// 总线上流动的事件。
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusEvent {
    Message {
        message: Message,
    },
    UserJoined {
        room_id: RoomId,
        user_id: UserId,
        username: String,
        member_count: u32,
    },
    UserLeft {
        room_id: RoomId,
        user_id: UserId,
        username: String,
        member_count: u32,
    },
    TypingUpdate {
        room_id: RoomId,
        typing_users: Vec<String>,
    },
    MessageEdited {
        message: Message,
    },
    MessageDeleted {
        room_id: RoomId,
        message_id: MessageId,
    },
    RoomCreated {
        room_id: RoomId,
        name: String,
    },
    Broadcast {
        content: String,
    },
}

/// 事件信封；`exclude_user` 标记不需要回声的始发用户。
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BusEnvelope {
    pub event: BusEvent,
    pub exclude_user: Option<UserId>,
}

impl BusEnvelope {
    pub fn new(event: BusEvent) -> Self {
        Self {
            event,
            exclude_user: None,
        }
    }

    pub fn excluding(event: BusEvent, user: UserId) -> Self {
        Self {
            event,
            exclude_user: Some(user),
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// 单个频道的订阅句柄；丢弃句柄即取消订阅。
pub struct Subscription {
    receiver: mpsc::Receiver<BusEnvelope>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<BusEnvelope>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> Option<BusEnvelope> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// 尽力投递；失败由调用方决定是否降级。
    async fn publish(&self, channel: &str, envelope: BusEnvelope) -> Result<(), BusError>;
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError>;
}
