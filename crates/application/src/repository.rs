//! 持久化存储能力定义
//!
//! 核心只依赖这组 trait；Postgres 与内存两种实现都在基础设施层。
//! 所有写操作按自然键幂等。

use async_trait::async_trait;
use domain::{
    ChatRoom, Message, MessageId, RepositoryError, RoomId, RoomMember, RoomName, Timestamp, User,
    UserId, Username,
};

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, user: User) -> Result<User, RepositoryError>;
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError>;
    /// 仅匹配 `is_online = true` 的用户名；在线用户名唯一。
    async fn find_by_username_online(
        &self,
        username: &Username,
    ) -> Result<Option<User>, RepositoryError>;
    /// 下线时同时清空 `current_room` 并刷新 `last_seen`。
    async fn set_online(&self, id: UserId, online: bool, at: Timestamp)
        -> Result<(), RepositoryError>;
    async fn update_room(
        &self,
        id: UserId,
        room: Option<&RoomName>,
    ) -> Result<(), RepositoryError>;
    /// 调整连接计数，返回调整后的值。
    async fn adjust_connections(&self, id: UserId, delta: i32) -> Result<u32, RepositoryError>;
    async fn record_message(&self, id: UserId, at: Timestamp) -> Result<(), RepositoryError>;
    async fn online_users(&self) -> Result<Vec<User>, RepositoryError>;
    /// 物理清除离线超过阈值的用户，返回清除数量。
    async fn purge_inactive(&self, older_than: Timestamp) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait RoomRepository: Send + Sync {
    /// 名字唯一冲突时返回 `RepositoryError::Conflict`。
    async fn create(&self, room: ChatRoom) -> Result<ChatRoom, RepositoryError>;
    async fn find_by_id(&self, id: RoomId) -> Result<Option<ChatRoom>, RepositoryError>;
    async fn find_by_name_active(
        &self,
        name: &RoomName,
    ) -> Result<Option<ChatRoom>, RepositoryError>;
    async fn find_active(&self, limit: u32) -> Result<Vec<ChatRoom>, RepositoryError>;
    /// 应用成员数增量并返回新值；降到 0 时房间停用，增量为正时恢复。
    async fn adjust_user_count(
        &self,
        id: RoomId,
        delta: i32,
        at: Timestamp,
    ) -> Result<u32, RepositoryError>;
    async fn record_message(&self, id: RoomId, at: Timestamp) -> Result<(), RepositoryError>;
    /// 首次加入的用户计入 `total_unique_users`。
    async fn record_unique_user(&self, id: RoomId) -> Result<(), RepositoryError>;
    /// 清除空置超过阈值的房间，返回清除数量。
    async fn cleanup_empty(&self, older_than: Timestamp) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait MemberRepository: Send + Sync {
    /// 创建或复活成员关系（复活时累计 `join_count`）。
    async fn join(
        &self,
        room_id: RoomId,
        user_id: UserId,
        username: &Username,
        at: Timestamp,
    ) -> Result<RoomMember, RepositoryError>;
    async fn leave(
        &self,
        room_id: RoomId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError>;
    async fn active_members(&self, room_id: RoomId) -> Result<Vec<RoomMember>, RepositoryError>;
    async fn active_rooms_of(&self, user_id: UserId) -> Result<Vec<RoomId>, RepositoryError>;
    async fn record_message(
        &self,
        room_id: RoomId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError>;
    async fn purge_inactive(&self, older_than: Timestamp) -> Result<u64, RepositoryError>;
}

/// 房间消息统计（`stats` 命令）。
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RoomMessageStats {
    pub messages: u64,
    pub senders: u64,
    pub first_at: Option<Timestamp>,
    pub last_at: Option<Timestamp>,
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError>;
    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError>;
    /// 最新在前；`before` 为翻页游标。
    async fn history(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, RepositoryError>;
    async fn by_user(&self, user_id: UserId, limit: u32) -> Result<Vec<Message>, RepositoryError>;
    async fn update_content(
        &self,
        id: MessageId,
        content: &str,
        at: Timestamp,
    ) -> Result<Message, RepositoryError>;
    async fn delete(&self, id: MessageId) -> Result<(), RepositoryError>;
    async fn purge_expired(&self, older_than: Timestamp) -> Result<u64, RepositoryError>;
    async fn room_stats(
        &self,
        room_id: RoomId,
        hours_back: u32,
    ) -> Result<RoomMessageStats, RepositoryError>;
}
