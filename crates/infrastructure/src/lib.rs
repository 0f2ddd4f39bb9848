//! 基础设施层
//!
//! 熔断器、重试、受守护的存储访问、Postgres 实现与 Redis 共享面。

pub mod builder;
pub mod circuit_breaker;
pub mod guarded;
pub mod redis;
pub mod repository;
pub mod retry;

pub use builder::{Infrastructure, InfrastructureError, Storage};
pub use circuit_breaker::{
    BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitError, CircuitState,
};
pub use guarded::{
    GuardedMemberRepository, GuardedMessageRepository, GuardedRoomRepository,
    GuardedUserRepository, StoreGuard,
};
pub use retry::{retry_async, Backoff, RetryConfig};
