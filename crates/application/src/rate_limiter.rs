//! 按客户端地址限流
//!
//! 每个 (地址, 动作类别) 一个令牌桶；耗尽后进入封禁窗口。
//! 进程内实现保证总线/存储降级时限流依然生效。

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// 限流动作类别。类别是封闭枚举：没有映射到类别的帧类型
/// 不经过限流器，等价于"未知类别直接放行"。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionClass {
    Message,
    RoomCreate,
    Command,
    Connection,
}

/// 单个类别的参数：点数、补充窗口、封禁时长。
#[derive(Debug, Clone, Copy)]
pub struct ClassPolicy {
    pub points: u32,
    pub refill: Duration,
    pub block: Duration,
}

impl ActionClass {
    pub fn policy(&self) -> ClassPolicy {
        match self {
            ActionClass::Message => ClassPolicy {
                points: 10,
                refill: Duration::from_secs(1),
                block: Duration::from_secs(60),
            },
            ActionClass::RoomCreate => ClassPolicy {
                points: 5,
                refill: Duration::from_secs(3600),
                block: Duration::from_secs(3600),
            },
            ActionClass::Command => ClassPolicy {
                points: 10,
                refill: Duration::from_secs(60),
                block: Duration::from_secs(60),
            },
            ActionClass::Connection => ClassPolicy {
                points: 10,
                refill: Duration::from_secs(60),
                block: Duration::from_secs(300),
            },
        }
    }
}

/// 一次检查的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_secs: u64,
    pub remaining: u32,
}

impl RateDecision {
    fn allowed(remaining: u32) -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0,
            remaining,
        }
    }

    fn blocked(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after_secs: retry_after.as_secs().max(1),
            remaining: 0,
        }
    }
}

struct Bucket {
    remaining: u32,
    window_started: Instant,
    blocked_until: Option<Instant>,
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<(String, ActionClass), Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// 原子地消耗一点；耗尽时进入封禁窗口。
    pub async fn check(&self, id: &str, class: ActionClass) -> RateDecision {
        let policy = class.policy();
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry((id.to_owned(), class))
            .or_insert_with(|| Bucket {
                remaining: policy.points,
                window_started: now,
                blocked_until: None,
            });

        if let Some(until) = bucket.blocked_until {
            if until > now {
                return RateDecision::blocked(until - now);
            }
            bucket.blocked_until = None;
            bucket.remaining = policy.points;
            bucket.window_started = now;
        }

        if now.duration_since(bucket.window_started) >= policy.refill {
            bucket.remaining = policy.points;
            bucket.window_started = now;
        }

        if bucket.remaining > 0 {
            bucket.remaining -= 1;
            RateDecision::allowed(bucket.remaining)
        } else {
            bucket.blocked_until = Some(now + policy.block);
            RateDecision::blocked(policy.block)
        }
    }

    /// 清理空闲桶，由后台维护任务周期调用。
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|(_, class), bucket| {
            if let Some(until) = bucket.blocked_until {
                return until > now;
            }
            let policy = class.policy();
            now.duration_since(bucket.window_started) < policy.refill * 2
        });
        before - buckets.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
