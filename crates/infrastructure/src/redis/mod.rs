//! Redis 共享面
//!
//! 总线（Pub/Sub）、共享缓存层（KV）与房间在线集合。
//! 所有命令都带 5 秒超时并经熔断器保护。

pub mod bus;
pub mod kv;
pub mod presence;

pub use bus::RedisBus;
pub use kv::RedisKv;
pub use presence::RedisPresenceStore;

use tokio::time::Duration;

/// Redis 命令超时。
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
