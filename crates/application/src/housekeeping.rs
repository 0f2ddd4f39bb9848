//! 后台维护任务
//!
//! 单个定时循环：清除过期消息（30 天）、离线用户与失效成员
//! 关系（30 天）、空置房间（1 小时），并回收空闲限流桶。
//! 优雅停机时同样执行一轮。

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::clock::Clock;
use crate::rate_limiter::RateLimiter;
use crate::repository::{MemberRepository, MessageRepository, RoomRepository, UserRepository};

/// 消息与用户/成员关系的保留期。
pub const RETENTION: time::Duration = time::Duration::days(30);
/// 空置房间的保留期。
pub const EMPTY_ROOM_RETENTION: time::Duration = time::Duration::hours(1);
/// 维护周期。
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub struct Housekeeping {
    pub users: Arc<dyn UserRepository>,
    pub rooms: Arc<dyn RoomRepository>,
    pub members: Arc<dyn MemberRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub rate_limiter: Arc<RateLimiter>,
    pub clock: Arc<dyn Clock>,
}

impl Housekeeping {
    pub async fn run_once(&self) {
        let now = self.clock.now();

        match self.messages.purge_expired(now - RETENTION).await {
            Ok(purged) if purged > 0 => tracing::info!(purged, "清除过期消息"),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "message purge failed"),
        }

        match self.members.purge_inactive(now - RETENTION).await {
            Ok(purged) if purged > 0 => tracing::info!(purged, "清除失效成员关系"),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "membership purge failed"),
        }

        match self.users.purge_inactive(now - RETENTION).await {
            Ok(purged) if purged > 0 => tracing::info!(purged, "清除长期离线用户"),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "user purge failed"),
        }

        match self.rooms.cleanup_empty(now - EMPTY_ROOM_RETENTION).await {
            Ok(purged) if purged > 0 => tracing::info!(purged, "清除空置房间"),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "room cleanup failed"),
        }

        let swept = self.rate_limiter.sweep().await;
        if swept > 0 {
            tracing::debug!(swept, "rate-limit buckets reclaimed");
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即返回，跳过以免和启动预热挤在一起
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::memory::MemoryStorage;
    use crate::repository::UserRepository as _;
    use domain::{Timestamp, User, UserId, Username};

    #[tokio::test]
    async fn run_once_purges_stale_rows() {
        let storage = MemoryStorage::new();
        let clock = Arc::new(SystemClock);

        // 一个 40 天前下线的用户
        let mut stale = User::new(
            UserId::random(),
            Username::parse("stale").unwrap(),
            Timestamp::UNIX_EPOCH,
        );
        stale.is_online = false;
        storage.users.create(stale).await.unwrap();

        let keeper = Housekeeping {
            users: storage.users.clone(),
            rooms: storage.rooms.clone(),
            members: storage.members.clone(),
            messages: storage.messages.clone(),
            rate_limiter: Arc::new(RateLimiter::new()),
            clock,
        };
        keeper.run_once().await;

        assert!(storage.users.online_users().await.unwrap().is_empty());
    }
}
