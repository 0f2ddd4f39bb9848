//! Redis 房间在线集合
//!
//! 每个房间一个 Set，键 `room:{id}:members`，带 24 小时兜底过期。

use application::presence::{PresenceError, PresenceStore};
use async_trait::async_trait;
use domain::{RoomId, UserId};
use redis::aio::MultiplexedConnection;
use uuid::Uuid;

/// 兜底过期，防止异常退出遗留集合。
const MEMBER_SET_TTL_SECS: i64 = 86_400;

pub struct RedisPresenceStore {
    conn: MultiplexedConnection,
}

impl RedisPresenceStore {
    pub async fn connect(client: &redis::Client) -> Result<Self, redis::RedisError> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    fn members_key(room_id: RoomId) -> String {
        format!("room:{room_id}:members")
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn add_member(&self, room_id: RoomId, user_id: UserId) -> Result<(), PresenceError> {
        let key = Self::members_key(room_id);
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .sadd(&key, user_id.to_string())
            .expire(&key, MEMBER_SET_TTL_SECS)
            .query_async(&mut conn)
            .await
            .map_err(|e| PresenceError::Store(e.to_string()))?;
        Ok(())
    }

    async fn remove_member(&self, room_id: RoomId, user_id: UserId) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SREM")
            .arg(Self::members_key(room_id))
            .arg(user_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| PresenceError::Store(e.to_string()))?;
        Ok(())
    }

    async fn members(&self, room_id: RoomId) -> Result<Vec<UserId>, PresenceError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("SMEMBERS")
            .arg(Self::members_key(room_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| PresenceError::Store(e.to_string()))?;

        raw.into_iter()
            .map(|s| {
                s.parse::<Uuid>()
                    .map(UserId::from)
                    .map_err(|e| PresenceError::Store(format!("invalid uuid in member set: {e}")))
            })
            .collect()
    }

    async fn clear_room(&self, room_id: RoomId) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(Self::members_key(room_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| PresenceError::Store(e.to_string()))?;
        Ok(())
    }
}
