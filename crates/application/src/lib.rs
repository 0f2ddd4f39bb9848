//! 应用层：消息平面的用例服务与端口定义
//!
//! 存储、总线、共享缓存都以 trait 形式出现；服务通过
//! `…Dependencies` 结构在启动时显式装配，进程内没有全局单例。

pub mod bus;
pub mod cache;
pub mod clock;
pub mod error;
pub mod housekeeping;
pub mod local_bus;
pub mod memory;
pub mod presence;
pub mod rate_limiter;
pub mod repository;
pub mod services;
pub mod typing;

pub use bus::{channels, Bus, BusEnvelope, BusError, BusEvent, Subscription};
pub use cache::{CacheStats, KvError, LayeredCache, SharedKv};
pub use clock::{Clock, SystemClock};
pub use error::{ApplicationError, ApplicationResult};
pub use housekeeping::Housekeeping;
pub use local_bus::LocalBus;
pub use memory::MemoryStorage;
pub use presence::{MemoryPresenceStore, PresenceError, PresenceStore};
pub use rate_limiter::{ActionClass, RateDecision, RateLimiter};
pub use repository::{
    MemberRepository, MessageRepository, RoomMessageStats, RoomRepository, UserRepository,
};
pub use services::{
    AuthOutcome, DisconnectOutcome, JoinOutcome, LeaveOutcome, MessageService,
    MessageServiceDependencies, RoomRegistry, RoomRegistryDependencies, UserRegistry,
    UserRegistryDependencies, EDIT_WINDOW, HISTORY_LIMIT,
};
pub use typing::{TypingTracker, TYPING_TTL};
