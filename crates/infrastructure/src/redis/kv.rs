//! 共享缓存层（L2）
//!
//! 经熔断器访问的 Redis KV；熔断开启时缓存退化为纯 L1，
//! 读写都不阻塞调用方。

use std::sync::Arc;
use std::time::Duration;

use application::cache::{KvError, SharedKv};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::redis::COMMAND_TIMEOUT;

pub struct RedisKv {
    conn: MultiplexedConnection,
    breaker: Arc<CircuitBreaker>,
}

impl RedisKv {
    pub async fn connect(
        client: &redis::Client,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, redis::RedisError> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn, breaker })
    }

    async fn run<T>(
        &self,
        cmd: redis::Cmd,
    ) -> Result<T, KvError>
    where
        T: redis::FromRedisValue + Send + 'static,
    {
        let result = self
            .breaker
            .call(|| {
                let mut conn = self.conn.clone();
                async move {
                    let query = async {
                        let value: T = cmd.query_async(&mut conn).await?;
                        Ok::<T, redis::RedisError>(value)
                    };
                    match tokio::time::timeout(COMMAND_TIMEOUT, query).await {
                        Ok(outcome) => outcome.map_err(|e| KvError::Other(e.to_string())),
                        Err(_) => Err(KvError::Other("redis command timed out".to_owned())),
                    }
                }
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(CircuitError::Open) => Err(KvError::Unavailable),
            Err(CircuitError::Inner(err)) => Err(err),
        }
    }
}

#[async_trait]
impl SharedKv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1));
        self.run::<()>(cmd).await
    }

    async fn del(&self, keys: &[String]) -> Result<(), KvError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        self.run::<i64>(cmd).await.map(|_| ())
    }
}
