use crate::value_objects::{RoomId, RoomName, Timestamp, UserId};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatRoom {
    pub id: RoomId,
    pub name: RoomName,
    pub created_by: UserId,
    pub created_at: Timestamp,
    pub last_activity: Timestamp,
    pub is_active: bool,
    pub current_users: u32,
    pub peak_users: u32,
    pub message_count: u64,
    pub total_unique_users: u32,
}

impl ChatRoom {
    pub fn new(id: RoomId, name: RoomName, created_by: UserId, now: Timestamp) -> Self {
        Self {
            id,
            name,
            created_by,
            created_at: now,
            last_activity: now,
            is_active: true,
            current_users: 0,
            peak_users: 0,
            message_count: 0,
            total_unique_users: 0,
        }
    }

    /// 应用成员数增量；降到 0 时房间停用，重新加入时恢复。
    pub fn apply_user_delta(&mut self, delta: i32, at: Timestamp) {
        let next = self.current_users.saturating_add_signed(delta);
        self.current_users = next;
        self.last_activity = at;
        if next == 0 {
            self.is_active = false;
        } else {
            self.is_active = true;
            if next > self.peak_users {
                self.peak_users = next;
            }
        }
    }

    pub fn record_message(&mut self, at: Timestamp) {
        self.message_count += 1;
        self.last_activity = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> ChatRoom {
        ChatRoom::new(
            RoomId::random(),
            RoomName::parse("lobby").unwrap(),
            UserId::random(),
            Timestamp::UNIX_EPOCH,
        )
    }

    #[test]
    fn deactivates_when_emptied_and_reactivates_on_rejoin() {
        let mut r = room();
        r.apply_user_delta(1, Timestamp::UNIX_EPOCH);
        r.apply_user_delta(1, Timestamp::UNIX_EPOCH);
        assert_eq!(r.peak_users, 2);

        r.apply_user_delta(-1, Timestamp::UNIX_EPOCH);
        r.apply_user_delta(-1, Timestamp::UNIX_EPOCH);
        assert_eq!(r.current_users, 0);
        assert!(!r.is_active);

        r.apply_user_delta(1, Timestamp::UNIX_EPOCH);
        assert!(r.is_active);
        assert_eq!(r.peak_users, 2);
    }

    #[test]
    fn user_count_never_goes_negative() {
        let mut r = room();
        r.apply_user_delta(-1, Timestamp::UNIX_EPOCH);
        assert_eq!(r.current_users, 0);
    }
}
