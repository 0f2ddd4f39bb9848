//! 统一配置中心
//!
//! 分层加载：内置默认值 → config/default.yml → config/local.yml
//! （本地开发覆盖，不提交）→ 环境变量（最高优先级）。
//! 配置错误时立即失败，服务不应在错误配置下启动。

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub cache: CacheConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// 数据库配置；`url` 为空时使用内存存储（开发/测试）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

/// Redis 配置；`url` 为空时总线退化为进程内扇出。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: Option<String>,
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// L1 默认存活秒数，上限 300
    pub default_ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_owned(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 10,
            },
            redis: RedisConfig { url: None },
            cache: CacheConfig {
                default_ttl_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// 唯一的配置加载入口。
    ///
    /// 约定的环境变量：`PORT`、`DATABASE_URL`、`DB_POOL_SIZE`、`REDIS_URL`；
    /// 结构化覆盖使用 `CHAT_` 前缀（如 `CHAT_SERVER__PORT`）。
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::file("config/default.yml"));

        if Path::new("config/local.yml").exists() {
            figment = figment.merge(Yaml::file("config/local.yml"));
        }

        figment = figment.merge(Env::prefixed("CHAT_").split("__"));

        let mut config: AppConfig = figment
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        // 约定俗成的裸环境变量优先
        if let Ok(port) = std::env::var("PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidServer(format!("invalid PORT: {port}")))?;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = Some(url);
        }
        if let Ok(size) = std::env::var("DB_POOL_SIZE") {
            config.database.max_connections = size
                .parse()
                .map_err(|_| ConfigError::InvalidDatabase(format!("invalid DB_POOL_SIZE: {size}")))?;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis.url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }

    /// 验证配置有效性，启动前调用。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidServer(
                "port must be non-zero".to_owned(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::InvalidDatabase(
                "max_connections must be greater than 0".to_owned(),
            ));
        }
        if let Some(url) = &self.database.url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(ConfigError::InvalidDatabase(format!(
                    "unsupported database url scheme: {url}"
                )));
            }
        }
        if let Some(url) = &self.redis.url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(ConfigError::InvalidRedis(format!(
                    "unsupported redis url scheme: {url}"
                )));
            }
        }
        if self.cache.default_ttl_secs == 0 || self.cache.default_ttl_secs > 300 {
            return Err(ConfigError::InvalidCache(
                "default_ttl_secs must be within 1..=300".to_owned(),
            ));
        }
        Ok(())
    }

    /// 测试专用配置：内存存储 + 进程内总线。
    pub fn test_config() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_owned(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 5,
            },
            redis: RedisConfig { url: None },
            cache: CacheConfig {
                default_ttl_secs: 60,
            },
        }
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid server configuration: {0}")]
    InvalidServer(String),
    #[error("invalid database configuration: {0}")]
    InvalidDatabase(String),
    #[error("invalid redis configuration: {0}")]
    InvalidRedis(String),
    #[error("invalid cache configuration: {0}")]
    InvalidCache(String),
    #[error("configuration parsing error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(AppConfig::default().validate().is_ok());
        assert!(AppConfig::test_config().validate().is_ok());
    }

    #[test]
    fn rejects_zero_pool() {
        let mut config = AppConfig::test_config();
        config.database.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_schemes() {
        let mut config = AppConfig::test_config();
        config.database.url = Some("mysql://elsewhere/db".to_owned());
        assert!(config.validate().is_err());

        let mut config = AppConfig::test_config();
        config.redis.url = Some("http://not-redis".to_owned());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_excessive_cache_ttl() {
        let mut config = AppConfig::test_config();
        config.cache.default_ttl_secs = 301;
        assert!(config.validate().is_err());
    }
}
