use crate::value_objects::{RoomId, Timestamp, UserId, Username};

/// 用户与房间之间的成员关系。
///
/// 每个 `(room_id, user_id)` 对最多存在一条记录；
/// 离开后保留为非活跃状态，重新加入时复活并累计 `join_count`。
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RoomMember {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: Username,
    pub joined_at: Timestamp,
    pub left_at: Option<Timestamp>,
    pub is_active: bool,
    pub messages_in_room: u64,
    pub join_count: u32,
    pub last_message_at: Option<Timestamp>,
}

impl RoomMember {
    pub fn new(room_id: RoomId, user_id: UserId, username: Username, now: Timestamp) -> Self {
        Self {
            room_id,
            user_id,
            username,
            joined_at: now,
            left_at: None,
            is_active: true,
            messages_in_room: 0,
            join_count: 1,
            last_message_at: None,
        }
    }

    pub fn rejoin(&mut self, now: Timestamp) {
        self.is_active = true;
        self.left_at = None;
        self.joined_at = now;
        self.join_count += 1;
    }

    pub fn leave(&mut self, now: Timestamp) {
        self.is_active = false;
        self.left_at = Some(now);
    }

    pub fn record_message(&mut self, at: Timestamp) {
        self.messages_in_room += 1;
        self.last_message_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejoin_reactivates_and_counts() {
        let mut m = RoomMember::new(
            RoomId::random(),
            UserId::random(),
            Username::parse("bob").unwrap(),
            Timestamp::UNIX_EPOCH,
        );
        m.leave(Timestamp::UNIX_EPOCH);
        assert!(!m.is_active);
        assert!(m.left_at.is_some());

        m.rejoin(Timestamp::UNIX_EPOCH);
        assert!(m.is_active);
        assert!(m.left_at.is_none());
        assert_eq!(m.join_count, 2);
    }
}
