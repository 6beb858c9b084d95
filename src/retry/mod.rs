//! 重试策略模块
//!
//! 同时服务于两处：客户端调用失败后换节点重试，以及首次注册失败后的退避等待。

pub mod exponential;
pub mod fixed;

pub use exponential::ExponentialBackoffPolicy;
pub use fixed::FixedRetryPolicy;

use std::time::Duration;
use tonic::Status;

/// 重试策略 trait
pub trait RetryPolicy: Send + Sync {
    /// 第 `attempt` 次（从 0 开始）失败后是否继续重试
    fn should_retry(&self, attempt: usize, error: &Status) -> bool {
        attempt + 1 < self.max_attempts() && crate::error::status::is_retryable(error)
    }

    /// 第 `attempt` 次失败后的等待时长
    fn backoff_duration(&self, attempt: usize) -> Duration;

    fn max_attempts(&self) -> usize;
}
