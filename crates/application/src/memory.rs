//! 内存存储实现
//!
//! 与 Postgres 实现语义一致：按自然键幂等、名字唯一冲突、
//! 成员数归零停用。用于测试和无数据库的单实例运行。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    ChatRoom, Message, MessageId, RepositoryError, RoomId, RoomMember, RoomName, Timestamp, User,
    UserId, Username,
};
use tokio::sync::RwLock;

use crate::repository::{
    MemberRepository, MessageRepository, RoomMessageStats, RoomRepository, UserRepository,
};

/// 四个仓储的内存聚合，方便一次性构建。
#[derive(Clone, Default)]
pub struct MemoryStorage {
    pub users: Arc<MemoryUserRepository>,
    pub rooms: Arc<MemoryRoomRepository>,
    pub members: Arc<MemoryMemberRepository>,
    pub messages: Arc<MemoryMessageRepository>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Default)]
pub struct MemoryUserRepository {
    users: RwLock<HashMap<UserId, User>>,
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn create(&self, user: User) -> Result<User, RepositoryError> {
        let mut users = self.users.write().await;
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn find_by_username_online(
        &self,
        username: &Username,
    ) -> Result<Option<User>, RepositoryError> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.is_online && u.username == *username)
            .cloned())
    }

    async fn set_online(
        &self,
        id: UserId,
        online: bool,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        let mut users = self.users.write().await;
        let user = users.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        if online {
            user.is_online = true;
            user.last_seen = at;
        } else {
            user.mark_offline(at);
        }
        Ok(())
    }

    async fn update_room(
        &self,
        id: UserId,
        room: Option<&RoomName>,
    ) -> Result<(), RepositoryError> {
        let mut users = self.users.write().await;
        let user = users.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        if let Some(room) = room {
            user.record_room(room);
        }
        user.current_room = room.cloned();
        Ok(())
    }

    async fn adjust_connections(&self, id: UserId, delta: i32) -> Result<u32, RepositoryError> {
        let mut users = self.users.write().await;
        let user = users.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        user.connection_count = user.connection_count.saturating_add_signed(delta);
        Ok(user.connection_count)
    }

    async fn record_message(&self, id: UserId, at: Timestamp) -> Result<(), RepositoryError> {
        let mut users = self.users.write().await;
        let user = users.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        user.record_message(at);
        Ok(())
    }

    async fn online_users(&self) -> Result<Vec<User>, RepositoryError> {
        let mut online: Vec<User> = self
            .users
            .read()
            .await
            .values()
            .filter(|u| u.is_online)
            .cloned()
            .collect();
        online.sort_by(|a, b| a.username.as_str().cmp(b.username.as_str()));
        Ok(online)
    }

    async fn purge_inactive(&self, older_than: Timestamp) -> Result<u64, RepositoryError> {
        let mut users = self.users.write().await;
        let before = users.len();
        users.retain(|_, u| u.is_online || u.last_seen >= older_than);
        Ok((before - users.len()) as u64)
    }
}

#[derive(Default)]
pub struct MemoryRoomRepository {
    rooms: RwLock<HashMap<RoomId, ChatRoom>>,
}

#[async_trait]
impl RoomRepository for MemoryRoomRepository {
    async fn create(&self, room: ChatRoom) -> Result<ChatRoom, RepositoryError> {
        let mut rooms = self.rooms.write().await;
        if let Some(existing) = rooms.values_mut().find(|r| r.name == room.name) {
            // 活跃同名房间冲突；空置停用的同名房间由重新创建复活
            if existing.is_active {
                return Err(RepositoryError::Conflict);
            }
            existing.is_active = true;
            existing.last_activity = room.created_at;
            return Ok(existing.clone());
        }
        rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn find_by_id(&self, id: RoomId) -> Result<Option<ChatRoom>, RepositoryError> {
        Ok(self.rooms.read().await.get(&id).cloned())
    }

    async fn find_by_name_active(
        &self,
        name: &RoomName,
    ) -> Result<Option<ChatRoom>, RepositoryError> {
        Ok(self
            .rooms
            .read()
            .await
            .values()
            .find(|r| r.is_active && r.name == *name)
            .cloned())
    }

    async fn find_active(&self, limit: u32) -> Result<Vec<ChatRoom>, RepositoryError> {
        let mut active: Vec<ChatRoom> = self
            .rooms
            .read()
            .await
            .values()
            .filter(|r| r.is_active)
            .cloned()
            .collect();
        active.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        active.truncate(limit as usize);
        Ok(active)
    }

    async fn adjust_user_count(
        &self,
        id: RoomId,
        delta: i32,
        at: Timestamp,
    ) -> Result<u32, RepositoryError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        room.apply_user_delta(delta, at);
        Ok(room.current_users)
    }

    async fn record_message(&self, id: RoomId, at: Timestamp) -> Result<(), RepositoryError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        room.record_message(at);
        Ok(())
    }

    async fn record_unique_user(&self, id: RoomId) -> Result<(), RepositoryError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        room.total_unique_users += 1;
        Ok(())
    }

    async fn cleanup_empty(&self, older_than: Timestamp) -> Result<u64, RepositoryError> {
        let mut rooms = self.rooms.write().await;
        let before = rooms.len();
        rooms.retain(|_, r| r.is_active || r.last_activity >= older_than);
        Ok((before - rooms.len()) as u64)
    }
}

#[derive(Default)]
pub struct MemoryMemberRepository {
    members: RwLock<HashMap<(RoomId, UserId), RoomMember>>,
}

#[async_trait]
impl MemberRepository for MemoryMemberRepository {
    async fn join(
        &self,
        room_id: RoomId,
        user_id: UserId,
        username: &Username,
        at: Timestamp,
    ) -> Result<RoomMember, RepositoryError> {
        let mut members = self.members.write().await;
        let member = members
            .entry((room_id, user_id))
            .and_modify(|m| {
                if !m.is_active {
                    m.rejoin(at);
                }
            })
            .or_insert_with(|| RoomMember::new(room_id, user_id, username.clone(), at));
        Ok(member.clone())
    }

    async fn leave(
        &self,
        room_id: RoomId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        let mut members = self.members.write().await;
        if let Some(member) = members.get_mut(&(room_id, user_id)) {
            member.leave(at);
        }
        Ok(())
    }

    async fn active_members(&self, room_id: RoomId) -> Result<Vec<RoomMember>, RepositoryError> {
        Ok(self
            .members
            .read()
            .await
            .values()
            .filter(|m| m.is_active && m.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn active_rooms_of(&self, user_id: UserId) -> Result<Vec<RoomId>, RepositoryError> {
        Ok(self
            .members
            .read()
            .await
            .values()
            .filter(|m| m.is_active && m.user_id == user_id)
            .map(|m| m.room_id)
            .collect())
    }

    async fn record_message(
        &self,
        room_id: RoomId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        let mut members = self.members.write().await;
        if let Some(member) = members.get_mut(&(room_id, user_id)) {
            member.record_message(at);
        }
        Ok(())
    }

    async fn purge_inactive(&self, older_than: Timestamp) -> Result<u64, RepositoryError> {
        let mut members = self.members.write().await;
        let before = members.len();
        members.retain(|_, m| {
            m.is_active || m.left_at.map(|left| left >= older_than).unwrap_or(true)
        });
        Ok((before - members.len()) as u64)
    }
}

#[derive(Default)]
pub struct MemoryMessageRepository {
    messages: RwLock<HashMap<MessageId, Message>>,
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError> {
        let mut messages = self.messages.write().await;
        messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn history(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let messages = self.messages.read().await;
        let cursor = before
            .and_then(|id| messages.get(&id))
            .map(|m| m.timestamp);

        let mut in_room: Vec<Message> = messages
            .values()
            .filter(|m| m.room_id == room_id)
            .filter(|m| cursor.map(|c| m.timestamp < c).unwrap_or(true))
            .cloned()
            .collect();
        in_room.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        in_room.truncate(limit as usize);
        Ok(in_room)
    }

    async fn by_user(&self, user_id: UserId, limit: u32) -> Result<Vec<Message>, RepositoryError> {
        let messages = self.messages.read().await;
        let mut by_user: Vec<Message> = messages
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        by_user.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        by_user.truncate(limit as usize);
        Ok(by_user)
    }

    async fn update_content(
        &self,
        id: MessageId,
        content: &str,
        at: Timestamp,
    ) -> Result<Message, RepositoryError> {
        let mut messages = self.messages.write().await;
        let message = messages.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        message.apply_edit(content, at);
        Ok(message.clone())
    }

    async fn delete(&self, id: MessageId) -> Result<(), RepositoryError> {
        self.messages.write().await.remove(&id);
        Ok(())
    }

    async fn purge_expired(&self, older_than: Timestamp) -> Result<u64, RepositoryError> {
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|_, m| m.timestamp >= older_than);
        Ok((before - messages.len()) as u64)
    }

    async fn room_stats(
        &self,
        room_id: RoomId,
        hours_back: u32,
    ) -> Result<RoomMessageStats, RepositoryError> {
        let floor = time::OffsetDateTime::now_utc() - time::Duration::hours(hours_back as i64);
        let messages = self.messages.read().await;
        let mut stats = RoomMessageStats::default();
        let mut senders = std::collections::HashSet::new();
        for message in messages
            .values()
            .filter(|m| m.room_id == room_id && m.timestamp >= floor)
        {
            stats.messages += 1;
            senders.insert(message.user_id);
            stats.first_at = Some(match stats.first_at {
                Some(first) if first < message.timestamp => first,
                _ => message.timestamp,
            });
            stats.last_at = Some(match stats.last_at {
                Some(last) if last > message.timestamp => last,
                _ => message.timestamp,
            });
        }
        stats.senders = senders.len() as u64;
        Ok(stats)
    }
}
