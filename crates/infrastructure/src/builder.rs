//! 基础设施装配
//!
//! 根据配置选择存储（Postgres / 内存）与总线（Redis / 进程内），
//! 并把存储访问包进熔断守护。核心代码只见到 trait 对象，
//! 不关心背后是哪种实现。

use std::sync::Arc;

use application::bus::Bus;
use application::cache::SharedKv;
use application::local_bus::LocalBus;
use application::memory::MemoryStorage;
use application::presence::{MemoryPresenceStore, PresenceStore};
use application::repository::{
    MemberRepository, MessageRepository, RoomRepository, UserRepository,
};
use config::AppConfig;
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use crate::circuit_breaker::CircuitBreaker;
use crate::guarded::{
    GuardedMemberRepository, GuardedMessageRepository, GuardedRoomRepository,
    GuardedUserRepository, StoreGuard,
};
use crate::redis::{RedisBus, RedisKv, RedisPresenceStore};
use crate::repository::{create_pg_pool, PgStorage, MIGRATOR};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// 装配完成的存储句柄（已经过熔断守护）。
#[derive(Clone)]
pub struct Storage {
    pub users: Arc<dyn UserRepository>,
    pub rooms: Arc<dyn RoomRepository>,
    pub members: Arc<dyn MemberRepository>,
    pub messages: Arc<dyn MessageRepository>,
}

pub struct Infrastructure {
    pub storage: Storage,
    pub bus: Arc<dyn Bus>,
    pub presence: Arc<dyn PresenceStore>,
    pub shared_kv: Option<Arc<dyn SharedKv>>,
    pub store_breaker: Arc<CircuitBreaker>,
    pub bus_breaker: Option<Arc<CircuitBreaker>>,
    pool: Option<PgPool>,
}

impl Infrastructure {
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let store_breaker = Arc::new(CircuitBreaker::new("store"));
        let guard = Arc::new(StoreGuard::new(store_breaker.clone()));

        let (storage, pool) = match &config.database.url {
            Some(url) => {
                let pool = create_pg_pool(url, config.database.max_connections).await?;
                MIGRATOR.run(&pool).await?;
                info!("Postgres 存储已连接");
                let pg = PgStorage::new(pool.clone());
                let storage = Storage {
                    users: Arc::new(GuardedUserRepository::new(pg.users, guard.clone())),
                    rooms: Arc::new(GuardedRoomRepository::new(pg.rooms, guard.clone())),
                    members: Arc::new(GuardedMemberRepository::new(pg.members, guard.clone())),
                    messages: Arc::new(GuardedMessageRepository::new(pg.messages, guard.clone())),
                };
                (storage, Some(pool))
            }
            None => {
                info!("未配置数据库，使用内存存储");
                let memory = MemoryStorage::new();
                let storage = Storage {
                    users: Arc::new(GuardedUserRepository::new(memory.users, guard.clone())),
                    rooms: Arc::new(GuardedRoomRepository::new(memory.rooms, guard.clone())),
                    members: Arc::new(GuardedMemberRepository::new(memory.members, guard.clone())),
                    messages: Arc::new(GuardedMessageRepository::new(memory.messages, guard)),
                };
                (storage, None)
            }
        };

        let (bus, presence, shared_kv, bus_breaker) = match &config.redis.url {
            Some(url) => {
                let client = redis::Client::open(url.as_str())?;
                let bus_breaker = Arc::new(CircuitBreaker::new("bus"));
                let kv_breaker = Arc::new(CircuitBreaker::new("shared-kv"));

                let bus = RedisBus::connect(client.clone(), bus_breaker.clone()).await?;
                let kv = RedisKv::connect(&client, kv_breaker).await?;
                let presence = RedisPresenceStore::connect(&client).await?;
                info!("使用 Redis 总线与共享缓存");

                (
                    Arc::new(bus) as Arc<dyn Bus>,
                    Arc::new(presence) as Arc<dyn PresenceStore>,
                    Some(Arc::new(kv) as Arc<dyn SharedKv>),
                    Some(bus_breaker),
                )
            }
            None => {
                info!("未配置 Redis，使用进程内总线");
                (
                    Arc::new(LocalBus::new()) as Arc<dyn Bus>,
                    Arc::new(MemoryPresenceStore::new()) as Arc<dyn PresenceStore>,
                    None,
                    None,
                )
            }
        };

        Ok(Self {
            storage,
            bus,
            presence,
            shared_kv,
            store_breaker,
            bus_breaker,
            pool,
        })
    }

    /// 优雅停机：断开数据库连接池。
    pub async fn disconnect(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
            info!("数据库连接池已关闭");
        }
    }
}
