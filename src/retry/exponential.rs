use super::RetryPolicy;
use rand::Rng;
use std::time::Duration;

/// 指数退避重试策略
///
/// 延迟为 `base_delay * 2^attempt`，封顶 `max_delay`；可选叠加最多 10% 的随机抖动，
/// 避免大量实例同时重试注册中心。
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl ExponentialBackoffPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    /// 不限制次数，仅用于计算退避时长（首次注册会一直重试直到成功或被取消）
    pub fn unbounded(base_delay: Duration, max_delay: Duration) -> Self {
        Self::new(usize::MAX, base_delay, max_delay)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self::unbounded(Duration::from_millis(100), Duration::from_secs(5))
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn backoff_duration(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(10);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = (delay.as_millis() as u64 / 10).max(1);
        let extra = rand::thread_rng().gen_range(0..=spread);
        (delay + Duration::from_millis(extra)).min(self.max_delay)
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}
