//! 熔断器
//!
//! 三状态机保护共享依赖（数据库、Redis）：
//! CLOSED（正常）→ OPEN（连续 3 次失败后短路）→ HALF_OPEN（30 秒
//! 冷却后试探）→ CLOSED（3 次试探成功）。试探期任何失败立即回到 OPEN。

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

/// 断路器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// 连续失败多少次后断开
    pub failure_threshold: u32,
    /// OPEN 状态的冷却时间
    pub cooloff: Duration,
    /// 半开状态下连续成功多少次后闭合
    pub probe_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooloff: Duration::from_secs(30),
            probe_successes: 3,
        }
    }
}

/// 对外的健康快照。
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub health_ratio: f64,
}

/// 被熔断的调用结果。
#[derive(Debug)]
pub enum CircuitError<E> {
    /// 断路器断开，调用被短路
    Open,
    /// 操作本身失败
    Inner(E),
}

pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    probe_successes: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: &'static str) -> Self {
        Self::with_config(name, BreakerConfig::default())
    }

    pub fn with_config(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            probe_successes: AtomicU32::new(0),
            opened_at: Mutex::new(None),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Relaxed))
    }

    fn transition_to(&self, next: CircuitState) {
        let prev = self.state();
        if prev == next {
            return;
        }
        self.state.store(next as u8, Ordering::Relaxed);
        match next {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.probe_successes.store(0, Ordering::Relaxed);
                info!(breaker = self.name, "circuit {:?} → CLOSED", prev);
            }
            CircuitState::Open => {
                *self.opened_at.lock().expect("breaker clock lock") = Some(Instant::now());
                error!(breaker = self.name, "circuit {:?} → OPEN", prev);
            }
            CircuitState::HalfOpen => {
                self.probe_successes.store(0, Ordering::Relaxed);
                warn!(breaker = self.name, "circuit {:?} → HALF_OPEN", prev);
            }
        }
    }

    /// 当前是否放行请求；OPEN 状态超过冷却时间时转入半开。
    pub fn allow(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = *self.opened_at.lock().expect("breaker clock lock");
                if let Some(at) = opened_at {
                    if at.elapsed() >= self.config.cooloff {
                        self.transition_to(CircuitState::HalfOpen);
                        return true;
                    }
                }
                false
            }
        }
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        match self.state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {
                let probes = self.probe_successes.fetch_add(1, Ordering::Relaxed) + 1;
                if probes >= self.config.probe_successes {
                    self.transition_to(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        match self.state() {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// 经熔断器执行一次操作。
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.allow() {
            return Err(CircuitError::Open);
        }
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CircuitError::Inner(err))
            }
        }
    }

    /// 短路或失败时转入降级路径。
    pub async fn call_with_fallback<T, E, F, Fut, FB, FutB>(
        &self,
        op: F,
        fallback: FB,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> FutB,
        FutB: Future<Output = Result<T, E>>,
    {
        match self.call(op).await {
            Ok(value) => Ok(value),
            Err(CircuitError::Open) => fallback().await,
            Err(CircuitError::Inner(_)) => fallback().await,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let total_failures = self.total_failures.load(Ordering::Relaxed);
        let total_successes = self.total_successes.load(Ordering::Relaxed);
        let total = total_failures + total_successes;
        BreakerSnapshot {
            state: self.state(),
            failure_count: self.consecutive_failures.load(Ordering::Relaxed),
            success_count: self.probe_successes.load(Ordering::Relaxed),
            total_failures,
            total_successes,
            health_ratio: if total == 0 {
                1.0
            } else {
                total_successes as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .call::<(), _, _, _>(|| async { Err::<(), &str>("boom") })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let _ = breaker
            .call::<_, &str, _, _>(|| async { Ok::<(), &str>(()) })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_three_consecutive_failures() {
        let breaker = CircuitBreaker::new("test");
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // 断开期间短路
        let result = breaker
            .call::<(), &str, _, _>(|| async { panic!("must not run") })
            .await;
        assert!(matches!(result, Err(CircuitError::Open)));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_streak() {
        let breaker = CircuitBreaker::new("test");
        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_opens_after_cooloff_and_closes_after_three_probes() {
        let breaker = CircuitBreaker::new("test");
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await;
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens() {
        let breaker = CircuitBreaker::new("test");
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_runs_when_open() {
        let breaker = CircuitBreaker::new("test");
        for _ in 0..3 {
            fail(&breaker).await;
        }
        let value = breaker
            .call_with_fallback::<_, &str, _, _, _, _>(
                || async { panic!("short-circuited") },
                || async { Ok("fallback") },
            )
            .await
            .unwrap();
        assert_eq!(value, "fallback");
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_health() {
        let breaker = CircuitBreaker::new("test");
        succeed(&breaker).await;
        fail(&breaker).await;
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.total_successes, 1);
        assert_eq!(snapshot.total_failures, 1);
        assert!((snapshot.health_ratio - 0.5).abs() < f64::EPSILON);
    }
}
