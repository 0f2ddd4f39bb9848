//! 两级读穿缓存
//!
//! L1 是进程内 TTL 映射，L2 是可选的共享 KV（经熔断器保护的 Redis）。
//! `set` 记录反向依赖：失效某个依赖键会级联失效所有依赖它的条目。
//! 模式失效只作用于本实例见过的键。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::ApplicationResult;
use crate::repository::{MessageRepository, RoomRepository, UserRepository};

/// L1 默认存活时间。
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
/// 任何条目允许的最长存活时间。
pub const MAX_TTL: Duration = Duration::from_secs(300);
/// 预热的活跃房间数与每房间消息数。
pub const WARM_ROOMS: u32 = 20;
pub const WARM_MESSAGES: u32 = 20;

/// 缓存键约定。`room(id)` 是依赖锚点：房间状态变化时
/// 失效它即可级联清掉名字缓存与消息缓存。
pub mod keys {
    use domain::{RoomId, RoomName, UserId};

    pub const ACTIVE_ROOMS: &str = "rooms:active";
    pub const ONLINE_USERS: &str = "users:online";

    pub fn room(room_id: RoomId) -> String {
        format!("room:{room_id}")
    }

    pub fn room_name(name: &RoomName) -> String {
        format!("room:name:{name}")
    }

    pub fn room_messages(room_id: RoomId) -> String {
        format!("room:{room_id}:messages")
    }

    pub fn user_info(user_id: UserId) -> String {
        format!("user:info:{user_id}")
    }
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv unavailable")]
    Unavailable,
    #[error("kv error: {0}")]
    Other(String),
}

/// 共享缓存层（Redis）；实现方负责熔断保护。
#[async_trait]
pub trait SharedKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;
    async fn del(&self, keys: &[String]) -> Result<(), KvError>;
}

struct L1Entry {
    value: Value,
    expires_at: Instant,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    invalidations: AtomicU64,
    warmups: AtomicU64,
}

/// 缓存统计快照。
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub invalidations: u64,
    pub warmups: u64,
    pub hit_rate: f64,
}

pub struct LayeredCache {
    l1: RwLock<HashMap<String, L1Entry>>,
    dependents: RwLock<HashMap<String, HashSet<String>>>,
    shared: Option<Arc<dyn SharedKv>>,
    default_ttl: Duration,
    counters: Counters,
}

impl LayeredCache {
    pub fn new(shared: Option<Arc<dyn SharedKv>>, default_ttl: Duration) -> Self {
        Self {
            l1: RwLock::new(HashMap::new()),
            dependents: RwLock::new(HashMap::new()),
            shared,
            default_ttl: default_ttl.min(MAX_TTL),
            counters: Counters::default(),
        }
    }

    pub fn in_process(default_ttl: Duration) -> Self {
        Self::new(None, default_ttl)
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        {
            let l1 = self.l1.read().await;
            if let Some(entry) = l1.get(key) {
                if entry.expires_at > Instant::now() {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
            }
        }
        // 过期条目惰性清除
        self.l1.write().await.remove(key);

        if let Some(kv) = &self.shared {
            match kv.get(key).await {
                Ok(Some(raw)) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&raw) {
                        self.store_l1(key, value.clone(), self.default_ttl).await;
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        return Some(value);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(key, error = %err, "shared cache read failed");
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// 读穿：命中返回缓存值，否则执行 `loader` 并回填两级。
    pub async fn get_or_load<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        deps: &[String],
        loader: F,
    ) -> ApplicationResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ApplicationResult<Value>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let value = loader().await?;
        self.set(key, value.clone(), ttl, deps).await;
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Duration, deps: &[String]) {
        let ttl = ttl.min(MAX_TTL);
        self.store_l1(key, value.clone(), ttl).await;
        if !deps.is_empty() {
            let mut dependents = self.dependents.write().await;
            for dep in deps {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(key.to_owned());
            }
        }
        if let Some(kv) = &self.shared {
            match serde_json::to_string(&value) {
                Ok(raw) => {
                    if let Err(err) = kv.set(key, &raw, ttl).await {
                        tracing::debug!(key, error = %err, "shared cache write failed");
                    }
                }
                Err(err) => tracing::debug!(key, error = %err, "cache value serialization failed"),
            }
        }
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
    }

    async fn store_l1(&self, key: &str, value: Value, ttl: Duration) {
        self.l1.write().await.insert(
            key.to_owned(),
            L1Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// 失效一个键；`cascade` 时连同依赖它的条目一起失效。
    pub async fn invalidate(&self, key: &str, cascade: bool) {
        let mut doomed = vec![key.to_owned()];
        if cascade {
            let dependents = self.dependents.read().await;
            let mut queue = vec![key.to_owned()];
            let mut seen: HashSet<String> = doomed.iter().cloned().collect();
            while let Some(current) = queue.pop() {
                if let Some(children) = dependents.get(&current) {
                    for child in children {
                        if seen.insert(child.clone()) {
                            doomed.push(child.clone());
                            queue.push(child.clone());
                        }
                    }
                }
            }
        }

        {
            let mut l1 = self.l1.write().await;
            for key in &doomed {
                l1.remove(key);
            }
        }
        {
            let mut dependents = self.dependents.write().await;
            for key in &doomed {
                dependents.remove(key);
            }
        }
        if let Some(kv) = &self.shared {
            if let Err(err) = kv.del(&doomed).await {
                tracing::debug!(error = %err, "shared cache delete failed");
            }
        }
        self.counters
            .invalidations
            .fetch_add(doomed.len() as u64, Ordering::Relaxed);
    }

    /// 按通配模式失效本实例见过的键。
    pub async fn invalidate_pattern(&self, pattern: &str) {
        let mut matched: HashSet<String> = HashSet::new();
        {
            let l1 = self.l1.read().await;
            matched.extend(l1.keys().filter(|k| glob_match(pattern, k)).cloned());
        }
        {
            let dependents = self.dependents.read().await;
            matched.extend(
                dependents
                    .keys()
                    .filter(|k| glob_match(pattern, k))
                    .cloned(),
            );
        }
        for key in matched {
            self.invalidate(&key, true).await;
        }
    }

    /// 预热：活跃房间、在线用户和每个房间最近的消息。
    pub async fn warm(
        &self,
        rooms: &dyn RoomRepository,
        users: &dyn UserRepository,
        messages: &dyn MessageRepository,
    ) -> Result<u32, domain::RepositoryError> {
        let active = rooms.find_active(WARM_ROOMS).await?;
        if let Ok(value) = serde_json::to_value(&active) {
            self.set(keys::ACTIVE_ROOMS, value, self.default_ttl, &[]).await;
        }

        match users.online_users().await {
            Ok(online) => {
                if let Ok(value) = serde_json::to_value(&online) {
                    self.set(keys::ONLINE_USERS, value, self.default_ttl, &[]).await;
                }
            }
            Err(err) => tracing::warn!(error = %err, "warmup: online users unavailable"),
        }

        let mut warmed = 0u32;
        for room in &active {
            let anchor = keys::room(room.id);
            if let Ok(value) = serde_json::to_value(room) {
                self.set(
                    &keys::room_name(&room.name),
                    value,
                    self.default_ttl,
                    std::slice::from_ref(&anchor),
                )
                .await;
            }
            match messages.history(room.id, WARM_MESSAGES, None).await {
                Ok(mut recent) => {
                    recent.reverse();
                    if let Ok(value) = serde_json::to_value(&recent) {
                        self.set(
                            &keys::room_messages(room.id),
                            value,
                            self.default_ttl,
                            std::slice::from_ref(&anchor),
                        )
                        .await;
                    }
                    warmed += 1;
                }
                Err(err) => {
                    tracing::warn!(room_id = %room.id, error = %err, "warmup: history unavailable");
                }
            }
        }

        self.counters.warmups.fetch_add(1, Ordering::Relaxed);
        tracing::info!(rooms = warmed, "缓存预热完成");
        Ok(warmed)
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            warmups: self.counters.warmups.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

/// `*` 通配匹配，迭代实现避免回溯爆炸。
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn glob_matching() {
        assert!(glob_match("room:*:messages", "room:42:messages"));
        assert!(glob_match("room:*", "room:42:messages"));
        assert!(!glob_match("room:*:events", "room:42:messages"));
        assert!(glob_match("*", "anything"));
    }

    #[tokio::test(start_paused = true)]
    async fn l1_entries_expire() {
        let cache = LayeredCache::in_process(Duration::from_secs(60));
        cache.set("k", json!(1), Duration::from_secs(10), &[]).await;
        assert_eq!(cache.get("k").await, Some(json!(1)));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("k").await, None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn invalidation_cascades_through_dependencies() {
        let cache = LayeredCache::in_process(Duration::from_secs(60));
        cache.set("room:1", json!("anchor"), DEFAULT_TTL, &[]).await;
        cache
            .set(
                "room:1:messages",
                json!(["a"]),
                DEFAULT_TTL,
                &["room:1".to_owned()],
            )
            .await;
        cache
            .set(
                "room:name:lobby",
                json!({"id": 1}),
                DEFAULT_TTL,
                &["room:1".to_owned()],
            )
            .await;

        cache.invalidate("room:1", true).await;
        assert_eq!(cache.get("room:1:messages").await, None);
        assert_eq!(cache.get("room:name:lobby").await, None);
    }

    #[tokio::test]
    async fn non_cascading_invalidation_keeps_dependents() {
        let cache = LayeredCache::in_process(Duration::from_secs(60));
        cache.set("dep", json!(0), DEFAULT_TTL, &[]).await;
        cache
            .set("child", json!(1), DEFAULT_TTL, &["dep".to_owned()])
            .await;

        cache.invalidate("dep", false).await;
        assert_eq!(cache.get("child").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn pattern_invalidation() {
        let cache = LayeredCache::in_process(Duration::from_secs(60));
        cache.set("room:1:messages", json!(1), DEFAULT_TTL, &[]).await;
        cache.set("room:2:messages", json!(2), DEFAULT_TTL, &[]).await;
        cache.set("users:online", json!(3), DEFAULT_TTL, &[]).await;

        cache.invalidate_pattern("room:*:messages").await;
        assert_eq!(cache.get("room:1:messages").await, None);
        assert_eq!(cache.get("room:2:messages").await, None);
        assert_eq!(cache.get("users:online").await, Some(json!(3)));
    }

    #[tokio::test]
    async fn read_through_loads_once() {
        let cache = LayeredCache::in_process(Duration::from_secs(60));
        let loaded = cache
            .get_or_load("k", DEFAULT_TTL, &[], || async { Ok(json!("fresh")) })
            .await
            .unwrap();
        assert_eq!(loaded, json!("fresh"));

        // 第二次命中缓存，loader 不应执行
        let cached = cache
            .get_or_load("k", DEFAULT_TTL, &[], || async {
                panic!("loader must not run on hit")
            })
            .await
            .unwrap();
        assert_eq!(cached, json!("fresh"));
    }
}
