use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use domain::{RoomId, UserId};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("presence store error: {0}")]
    Store(String),
}

/// 房间在线成员集合。多实例部署时由 Redis 集合承载，
/// 单实例时退化为内存实现。
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn add_member(&self, room_id: RoomId, user_id: UserId) -> Result<(), PresenceError>;
    async fn remove_member(&self, room_id: RoomId, user_id: UserId) -> Result<(), PresenceError>;
    async fn members(&self, room_id: RoomId) -> Result<Vec<UserId>, PresenceError>;
    async fn clear_room(&self, room_id: RoomId) -> Result<(), PresenceError>;
}

pub struct MemoryPresenceStore {
    rooms: RwLock<HashMap<RoomId, HashSet<UserId>>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryPresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn add_member(&self, room_id: RoomId, user_id: UserId) -> Result<(), PresenceError> {
        self.rooms
            .write()
            .await
            .entry(room_id)
            .or_default()
            .insert(user_id);
        Ok(())
    }

    async fn remove_member(&self, room_id: RoomId, user_id: UserId) -> Result<(), PresenceError> {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(&room_id) {
            members.remove(&user_id);
            if members.is_empty() {
                rooms.remove(&room_id);
            }
        }
        Ok(())
    }

    async fn members(&self, room_id: RoomId) -> Result<Vec<UserId>, PresenceError> {
        let rooms = self.rooms.read().await;
        Ok(rooms
            .get(&room_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn clear_room(&self, room_id: RoomId) -> Result<(), PresenceError> {
        self.rooms.write().await.remove(&room_id);
        Ok(())
    }
}
