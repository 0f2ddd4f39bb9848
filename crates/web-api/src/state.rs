use std::sync::Arc;
use std::time::Duration;

use application::cache::LayeredCache;
use application::clock::{Clock, SystemClock};
use application::rate_limiter::RateLimiter;
use application::services::{
    MessageService, MessageServiceDependencies, RoomRegistry, RoomRegistryDependencies,
    UserRegistry, UserRegistryDependencies,
};
use application::typing::TypingTracker;
use config::AppConfig;
use infrastructure::{CircuitBreaker, Infrastructure};

use crate::hub::ConnectionHub;
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub users: Arc<UserRegistry>,
    pub rooms: Arc<RoomRegistry>,
    pub messages: Arc<MessageService>,
    pub hub: Arc<ConnectionHub>,
    pub rate_limiter: Arc<RateLimiter>,
    pub cache: Arc<LayeredCache>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<Metrics>,
    pub store_breaker: Arc<CircuitBreaker>,
    pub bus_breaker: Option<Arc<CircuitBreaker>>,
    pub started_at: std::time::Instant,
}

/// 把基础设施装配成网关状态；服务全部显式构建，没有全局量。
pub fn build_state(infra: &Infrastructure, config: &AppConfig) -> AppState {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(LayeredCache::new(
        infra.shared_kv.clone(),
        Duration::from_secs(config.cache.default_ttl_secs),
    ));
    let typing = Arc::new(TypingTracker::new());

    let rooms = Arc::new(RoomRegistry::new(RoomRegistryDependencies {
        rooms: infra.storage.rooms.clone(),
        members: infra.storage.members.clone(),
        users: infra.storage.users.clone(),
        presence: infra.presence.clone(),
        cache: cache.clone(),
        bus: infra.bus.clone(),
        clock: clock.clone(),
        typing: typing.clone(),
    }));

    let users = Arc::new(UserRegistry::new(UserRegistryDependencies {
        users: infra.storage.users.clone(),
        rooms: rooms.clone(),
        cache: cache.clone(),
        clock: clock.clone(),
    }));

    let messages = Arc::new(MessageService::new(MessageServiceDependencies {
        messages: infra.storage.messages.clone(),
        rooms: infra.storage.rooms.clone(),
        members: infra.storage.members.clone(),
        users: infra.storage.users.clone(),
        cache: cache.clone(),
        bus: infra.bus.clone(),
        clock: clock.clone(),
        typing,
    }));

    let metrics = Arc::new(Metrics::default());
    let hub = Arc::new(ConnectionHub::new(
        infra.bus.clone(),
        cache.clone(),
        clock.clone(),
        metrics.clone(),
    ));

    AppState {
        users,
        rooms,
        messages,
        hub,
        rate_limiter: Arc::new(RateLimiter::new()),
        cache,
        clock,
        metrics,
        store_breaker: infra.store_breaker.clone(),
        bus_breaker: infra.bus_breaker.clone(),
        started_at: std::time::Instant::now(),
    }
}

impl AppState {
    /// 共享依赖是否降级（供 `/health` 使用）。
    pub fn degraded(&self) -> bool {
        use infrastructure::CircuitState;
        if self.store_breaker.state() != CircuitState::Closed {
            return true;
        }
        self.bus_breaker
            .as_ref()
            .map(|b| b.state() != CircuitState::Closed)
            .unwrap_or(false)
    }
}
