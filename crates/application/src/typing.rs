//! 输入状态跟踪
//!
//! 每个房间一个集合，条目 3 秒过期。跟踪器只负责状态变更，
//! 由调用方发布 `typing_update` 并调度过期回查。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use domain::{RoomId, UserId};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// 输入指示的存活时间。
pub const TYPING_TTL: Duration = Duration::from_secs(3);

struct TypingEntry {
    username: String,
    expires_at: Instant,
    generation: u64,
}

pub struct TypingTracker {
    rooms: Mutex<HashMap<RoomId, HashMap<UserId, TypingEntry>>>,
    generation: AtomicU64,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn usernames(entries: &HashMap<UserId, TypingEntry>, now: Instant) -> Vec<String> {
        let mut names: Vec<String> = entries
            .values()
            .filter(|e| e.expires_at > now)
            .map(|e| e.username.clone())
            .collect();
        names.sort();
        names
    }

    /// 标记用户正在输入；返回当前用户名列表与条目代号。
    /// 同一用户重复 start 会刷新过期时间并换新代号。
    pub async fn start(
        &self,
        room_id: RoomId,
        user_id: UserId,
        username: &str,
    ) -> (Vec<String>, u64) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Instant::now();
        let mut rooms = self.rooms.lock().await;
        let entries = rooms.entry(room_id).or_default();
        entries.insert(
            user_id,
            TypingEntry {
                username: username.to_owned(),
                expires_at: now + TYPING_TTL,
                generation,
            },
        );
        (Self::usernames(entries, now), generation)
    }

    /// 移除输入标记。TTL 内不存在的移除不是错误，返回 `None` 表示无变化。
    pub async fn stop(&self, room_id: RoomId, user_id: UserId) -> Option<Vec<String>> {
        let now = Instant::now();
        let mut rooms = self.rooms.lock().await;
        let entries = rooms.get_mut(&room_id)?;
        entries.remove(&user_id)?;
        let names = Self::usernames(entries, now);
        if entries.is_empty() {
            rooms.remove(&room_id);
        }
        Some(names)
    }

    /// 过期回查：只有代号匹配且确实到期时才移除。
    /// 返回 `Some(list)` 表示集合发生了变化。
    pub async fn expire(
        &self,
        room_id: RoomId,
        user_id: UserId,
        generation: u64,
    ) -> Option<Vec<String>> {
        let now = Instant::now();
        let mut rooms = self.rooms.lock().await;
        let entries = rooms.get_mut(&room_id)?;
        match entries.get(&user_id) {
            Some(entry) if entry.generation == generation && entry.expires_at <= now => {
                entries.remove(&user_id);
                let names = Self::usernames(entries, now);
                if entries.is_empty() {
                    rooms.remove(&room_id);
                }
                Some(names)
            }
            _ => None,
        }
    }

    /// 房间清空时丢弃全部输入状态。
    pub async fn clear_room(&self, room_id: RoomId) {
        self.rooms.lock().await.remove(&room_id);
    }
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let tracker = TypingTracker::new();
        let room = RoomId::random();
        let user = UserId::random();

        let (names, generation) = tracker.start(room, user, "frank").await;
        assert_eq!(names, vec!["frank".to_owned()]);

        tokio::time::advance(TYPING_TTL).await;
        let names = tracker.expire(room, user, generation).await.unwrap();
        assert!(names.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_invalidates_old_generation() {
        let tracker = TypingTracker::new();
        let room = RoomId::random();
        let user = UserId::random();

        let (_, old_generation) = tracker.start(room, user, "frank").await;
        tokio::time::advance(Duration::from_secs(2)).await;
        tracker.start(room, user, "frank").await;

        tokio::time::advance(Duration::from_secs(1)).await;
        // 旧代号的过期回查不得移除刷新后的条目
        assert!(tracker.expire(room, user, old_generation).await.is_none());
    }

    #[tokio::test]
    async fn stop_when_absent_is_not_an_error() {
        let tracker = TypingTracker::new();
        assert!(tracker
            .stop(RoomId::random(), UserId::random())
            .await
            .is_none());
    }
}
