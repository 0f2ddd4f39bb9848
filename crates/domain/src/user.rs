use crate::value_objects::{RoomName, Timestamp, UserId, Username};

/// 单个用户最多记住的历史房间数。
pub const MAX_ROOMS_JOINED: usize = 50;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: Username,
    pub created_at: Timestamp,
    pub last_seen: Timestamp,
    pub is_online: bool,
    pub current_room: Option<RoomName>,
    pub total_messages: u64,
    pub connection_count: u32,
    pub rooms_joined: Vec<String>,
}

impl User {
    /// 首次认证时创建的在线用户。
    pub fn new(id: UserId, username: Username, now: Timestamp) -> Self {
        Self {
            id,
            username,
            created_at: now,
            last_seen: now,
            is_online: true,
            current_room: None,
            total_messages: 0,
            connection_count: 1,
            rooms_joined: Vec::new(),
        }
    }

    /// 记录一次加入的房间，保持有界且去重。
    pub fn record_room(&mut self, room: &RoomName) {
        let name = room.as_str();
        if self.rooms_joined.iter().any(|r| r == name) {
            return;
        }
        if self.rooms_joined.len() >= MAX_ROOMS_JOINED {
            self.rooms_joined.remove(0);
        }
        self.rooms_joined.push(name.to_owned());
    }

    pub fn record_message(&mut self, at: Timestamp) {
        self.total_messages += 1;
        self.last_seen = at;
    }

    /// 最后一个连接断开后调用；离线用户不再占据房间。
    pub fn mark_offline(&mut self, at: Timestamp) {
        self.is_online = false;
        self.current_room = None;
        self.connection_count = 0;
        self.last_seen = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User::new(
            UserId::random(),
            Username::parse("alice").unwrap(),
            Timestamp::UNIX_EPOCH,
        )
    }

    #[test]
    fn rooms_joined_is_bounded_and_deduplicated() {
        let mut u = user();
        for i in 0..60 {
            let room = RoomName::parse(format!("room-{i:02}")).unwrap();
            u.record_room(&room);
            u.record_room(&room);
        }
        assert_eq!(u.rooms_joined.len(), MAX_ROOMS_JOINED);
        // 最旧的条目被淘汰
        assert_eq!(u.rooms_joined.first().map(String::as_str), Some("room-10"));
    }

    #[test]
    fn offline_clears_room_and_connections() {
        let mut u = user();
        u.current_room = Some(RoomName::parse("lobby").unwrap());
        u.mark_offline(Timestamp::UNIX_EPOCH);
        assert!(!u.is_online);
        assert!(u.current_room.is_none());
        assert_eq!(u.connection_count, 0);
    }
}
