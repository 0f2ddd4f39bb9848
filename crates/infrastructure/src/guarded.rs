//! 经熔断器与重试保护的存储访问
//!
//! 核心到持久层的每一次调用都走这里：先问熔断器，再带超时与
//! 有界重试执行。NotFound/Conflict 是业务结果，不计入熔断统计。

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    ChatRoom, Message, MessageId, RepositoryError, RoomId, RoomMember, RoomName, Timestamp, User,
    UserId, Username,
};
use tokio::time::Duration;

use application::repository::{
    MemberRepository, MessageRepository, RoomMessageStats, RoomRepository, UserRepository,
};

use crate::circuit_breaker::CircuitBreaker;
use crate::retry::{retry_async, RetryConfig};

/// 单次存储操作的上限。
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(45);

pub struct StoreGuard {
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    op_timeout: Duration,
}

impl StoreGuard {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            breaker,
            retry: RetryConfig::default(),
            op_timeout: OPERATION_TIMEOUT,
        }
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RepositoryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RepositoryError>>,
    {
        if !self.breaker.allow() {
            return Err(RepositoryError::Unavailable);
        }

        let timeout = self.op_timeout;
        let result = retry_async(
            &self.retry,
            |e: &RepositoryError| e.is_infrastructure(),
            || {
                let fut = op();
                async move {
                    match tokio::time::timeout(timeout, fut).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(RepositoryError::Timeout),
                    }
                }
            },
        )
        .await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) if e.is_infrastructure() => self.breaker.record_failure(),
            // 业务性结果说明依赖是健康的
            Err(_) => self.breaker.record_success(),
        }
        result
    }
}

pub struct GuardedUserRepository {
    inner: Arc<dyn UserRepository>,
    guard: Arc<StoreGuard>,
}

impl GuardedUserRepository {
    pub fn new(inner: Arc<dyn UserRepository>, guard: Arc<StoreGuard>) -> Self {
        Self { inner, guard }
    }
}

#[async_trait]
impl UserRepository for GuardedUserRepository {
    async fn create(&self, user: User) -> Result<User, RepositoryError> {
        self.guard.run(|| self.inner.create(user.clone())).await
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        self.guard.run(|| self.inner.find_by_id(id)).await
    }

    async fn find_by_username_online(
        &self,
        username: &Username,
    ) -> Result<Option<User>, RepositoryError> {
        self.guard
            .run(|| self.inner.find_by_username_online(username))
            .await
    }

    async fn set_online(
        &self,
        id: UserId,
        online: bool,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        self.guard.run(|| self.inner.set_online(id, online, at)).await
    }

    async fn update_room(
        &self,
        id: UserId,
        room: Option<&RoomName>,
    ) -> Result<(), RepositoryError> {
        self.guard.run(|| self.inner.update_room(id, room)).await
    }

    async fn adjust_connections(&self, id: UserId, delta: i32) -> Result<u32, RepositoryError> {
        self.guard
            .run(|| self.inner.adjust_connections(id, delta))
            .await
    }

    async fn record_message(&self, id: UserId, at: Timestamp) -> Result<(), RepositoryError> {
        self.guard.run(|| self.inner.record_message(id, at)).await
    }

    async fn online_users(&self) -> Result<Vec<User>, RepositoryError> {
        self.guard.run(|| self.inner.online_users()).await
    }

    async fn purge_inactive(&self, older_than: Timestamp) -> Result<u64, RepositoryError> {
        self.guard.run(|| self.inner.purge_inactive(older_than)).await
    }
}

pub struct GuardedRoomRepository {
    inner: Arc<dyn RoomRepository>,
    guard: Arc<StoreGuard>,
}

impl GuardedRoomRepository {
    pub fn new(inner: Arc<dyn RoomRepository>, guard: Arc<StoreGuard>) -> Self {
        Self { inner, guard }
    }
}

#[async_trait]
impl RoomRepository for GuardedRoomRepository {
    async fn create(&self, room: ChatRoom) -> Result<ChatRoom, RepositoryError> {
        self.guard.run(|| self.inner.create(room.clone())).await
    }

    async fn find_by_id(&self, id: RoomId) -> Result<Option<ChatRoom>, RepositoryError> {
        self.guard.run(|| self.inner.find_by_id(id)).await
    }

    async fn find_by_name_active(
        &self,
        name: &RoomName,
    ) -> Result<Option<ChatRoom>, RepositoryError> {
        self.guard.run(|| self.inner.find_by_name_active(name)).await
    }

    async fn find_active(&self, limit: u32) -> Result<Vec<ChatRoom>, RepositoryError> {
        self.guard.run(|| self.inner.find_active(limit)).await
    }

    async fn adjust_user_count(
        &self,
        id: RoomId,
        delta: i32,
        at: Timestamp,
    ) -> Result<u32, RepositoryError> {
        self.guard
            .run(|| self.inner.adjust_user_count(id, delta, at))
            .await
    }

    async fn record_message(&self, id: RoomId, at: Timestamp) -> Result<(), RepositoryError> {
        self.guard.run(|| self.inner.record_message(id, at)).await
    }

    async fn record_unique_user(&self, id: RoomId) -> Result<(), RepositoryError> {
        self.guard.run(|| self.inner.record_unique_user(id)).await
    }

    async fn cleanup_empty(&self, older_than: Timestamp) -> Result<u64, RepositoryError> {
        self.guard.run(|| self.inner.cleanup_empty(older_than)).await
    }
}

pub struct GuardedMemberRepository {
    inner: Arc<dyn MemberRepository>,
    guard: Arc<StoreGuard>,
}

impl GuardedMemberRepository {
    pub fn new(inner: Arc<dyn MemberRepository>, guard: Arc<StoreGuard>) -> Self {
        Self { inner, guard }
    }
}

#[async_trait]
impl MemberRepository for GuardedMemberRepository {
    async fn join(
        &self,
        room_id: RoomId,
        user_id: UserId,
        username: &Username,
        at: Timestamp,
    ) -> Result<RoomMember, RepositoryError> {
        self.guard
            .run(|| self.inner.join(room_id, user_id, username, at))
            .await
    }

    async fn leave(
        &self,
        room_id: RoomId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        self.guard.run(|| self.inner.leave(room_id, user_id, at)).await
    }

    async fn active_members(&self, room_id: RoomId) -> Result<Vec<RoomMember>, RepositoryError> {
        self.guard.run(|| self.inner.active_members(room_id)).await
    }

    async fn active_rooms_of(&self, user_id: UserId) -> Result<Vec<RoomId>, RepositoryError> {
        self.guard.run(|| self.inner.active_rooms_of(user_id)).await
    }

    async fn record_message(
        &self,
        room_id: RoomId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        self.guard
            .run(|| self.inner.record_message(room_id, user_id, at))
            .await
    }

    async fn purge_inactive(&self, older_than: Timestamp) -> Result<u64, RepositoryError> {
        self.guard.run(|| self.inner.purge_inactive(older_than)).await
    }
}

pub struct GuardedMessageRepository {
    inner: Arc<dyn MessageRepository>,
    guard: Arc<StoreGuard>,
}

impl GuardedMessageRepository {
    pub fn new(inner: Arc<dyn MessageRepository>, guard: Arc<StoreGuard>) -> Self {
        Self { inner, guard }
    }
}

#[async_trait]
impl MessageRepository for GuardedMessageRepository {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError> {
        self.guard.run(|| self.inner.create(message.clone())).await
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        self.guard.run(|| self.inner.find_by_id(id)).await
    }

    async fn history(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, RepositoryError> {
        self.guard
            .run(|| self.inner.history(room_id, limit, before))
            .await
    }

    async fn by_user(&self, user_id: UserId, limit: u32) -> Result<Vec<Message>, RepositoryError> {
        self.guard.run(|| self.inner.by_user(user_id, limit)).await
    }

    async fn update_content(
        &self,
        id: MessageId,
        content: &str,
        at: Timestamp,
    ) -> Result<Message, RepositoryError> {
        self.guard
            .run(|| self.inner.update_content(id, content, at))
            .await
    }

    async fn delete(&self, id: MessageId) -> Result<(), RepositoryError> {
        self.guard.run(|| self.inner.delete(id)).await
    }

    async fn purge_expired(&self, older_than: Timestamp) -> Result<u64, RepositoryError> {
        self.guard.run(|| self.inner.purge_expired(older_than)).await
    }

    async fn room_stats(
        &self,
        room_id: RoomId,
        hours_back: u32,
    ) -> Result<RoomMessageStats, RepositoryError> {
        self.guard.run(|| self.inner.room_stats(room_id, hours_back)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use application::memory::MemoryStorage;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingUserRepository {
        calls: AtomicU32,
    }

    #[async_trait]
    impl UserRepository for FailingUserRepository {
        async fn create(&self, _user: User) -> Result<User, RepositoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RepositoryError::storage("connection refused"))
        }
        async fn find_by_id(&self, _id: UserId) -> Result<Option<User>, RepositoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RepositoryError::storage("connection refused"))
        }
        async fn find_by_username_online(
            &self,
            _username: &Username,
        ) -> Result<Option<User>, RepositoryError> {
            Err(RepositoryError::storage("connection refused"))
        }
        async fn set_online(
            &self,
            _id: UserId,
            _online: bool,
            _at: Timestamp,
        ) -> Result<(), RepositoryError> {
            Err(RepositoryError::storage("connection refused"))
        }
        async fn update_room(
            &self,
            _id: UserId,
            _room: Option<&RoomName>,
        ) -> Result<(), RepositoryError> {
            Err(RepositoryError::storage("connection refused"))
        }
        async fn adjust_connections(
            &self,
            _id: UserId,
            _delta: i32,
        ) -> Result<u32, RepositoryError> {
            Err(RepositoryError::storage("connection refused"))
        }
        async fn record_message(&self, _id: UserId, _at: Timestamp) -> Result<(), RepositoryError> {
            Err(RepositoryError::storage("connection refused"))
        }
        async fn online_users(&self) -> Result<Vec<User>, RepositoryError> {
            Err(RepositoryError::storage("connection refused"))
        }
        async fn purge_inactive(&self, _older_than: Timestamp) -> Result<u64, RepositoryError> {
            Err(RepositoryError::storage("connection refused"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failures_are_retried_then_trip_the_breaker() {
        let failing = Arc::new(FailingUserRepository {
            calls: AtomicU32::new(0),
        });
        let guard = Arc::new(StoreGuard::new(Arc::new(CircuitBreaker::new("store"))));
        let guarded = GuardedUserRepository::new(failing.clone(), guard.clone());

        // 每次守护调用内部重试 3 次
        for _ in 0..3 {
            assert!(guarded.find_by_id(UserId::random()).await.is_err());
        }
        assert_eq!(failing.calls.load(Ordering::SeqCst), 9);

        // 熔断后短路，不再触达存储
        let err = guarded.find_by_id(UserId::random()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Unavailable));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn not_found_is_not_a_breaker_failure() {
        let storage = MemoryStorage::new();
        let guard = Arc::new(StoreGuard::new(Arc::new(CircuitBreaker::new("store"))));
        let guarded = GuardedUserRepository::new(storage.users.clone(), guard.clone());

        for _ in 0..5 {
            // 未知用户：Ok(None)，依赖健康
            assert!(guarded.find_by_id(UserId::random()).await.unwrap().is_none());
        }
        assert_eq!(
            guard.breaker().snapshot().state,
            crate::circuit_breaker::CircuitState::Closed
        );
    }
}
