//! 统一的重试/退避策略
//!
//! 回合交换与各工具执行器共用同一个 BackoffPolicy：最大尝试次数 + 基础延迟，指数增长并封顶，可选抖动。
//! 重试等待可被 CancellationToken 打断。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::RetrySection;

/// 错误自带的重试等待提示（例如 429 的 Retry-After）
pub trait RetryHint {
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// 指数退避策略
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// 总尝试次数（含首次），至少为 1
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RetrySection::default())
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: base_delay.saturating_mul(16),
            jitter: true,
        }
    }

    pub fn from_config(cfg: &RetrySection) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms.max(cfg.base_delay_ms)),
            jitter: cfg.jitter,
        }
    }

    /// 不重试：只尝试一次
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.max(self.base_delay);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// 单次超时为 per_attempt 时，用尽全部尝试所需的最长时间（含退避等待）
    pub fn total_budget(&self, per_attempt: Duration) -> Duration {
        let retries = self.max_attempts.saturating_sub(1);
        per_attempt
            .saturating_mul(self.max_attempts)
            .saturating_add(self.max_delay.saturating_mul(retries))
    }

    /// 第 retry_index 次重试前的等待（0 起）：base * 2^retry_index，封顶 max_delay；
    /// 开启抖动时取 [d/2, d] 之间的随机值
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        let shift = retry_index.min(20);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half_ms = (delay.as_millis() / 2) as u64;
        let extra = rand::thread_rng().gen_range(0..=half_ms);
        Duration::from_millis(half_ms + extra)
    }

    /// 重试前的实际等待：退避延迟与错误给出的 Retry-After 取较大者
    pub fn wait_before_retry<E: RetryHint>(&self, retry_index: u32, err: &E) -> Duration {
        let delay = self.delay_for(retry_index);
        err.retry_after().map_or(delay, |hint| delay.max(hint))
    }

    /// 按策略执行 op；仅当 is_retryable 判定为可重试时才等待并重试。
    /// op 接收当前尝试序号（1 起）。取消时立即返回最后一次错误。
    pub async fn retry<T, E, F, Fut, R>(
        &self,
        label: &str,
        cancel: Option<&CancellationToken>,
        is_retryable: R,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display + RetryHint,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.max_attempts || !is_retryable(&err) {
                        return Err(err);
                    }
                    let wait = self.wait_before_retry(attempt - 1, &err);
                    tracing::warn!(
                        op = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    if let Some(token) = cancel {
                        tokio::select! {
                            _ = token.cancelled() => return Err(err),
                            _ = tokio::time::sleep(wait) => {}
                        }
                    } else {
                        tokio::time::sleep(wait).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use crate::llm::LlmError;

    impl RetryHint for String {}

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = BackoffPolicy::new(5, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350))
            .without_jitter();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(30), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::new(3, Duration::from_millis(200));
        for _ in 0..50 {
            let d = policy.delay_for(0);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::new(3, Duration::from_millis(1));
        let result: Result<u32, String> = policy
            .retry("test", None, |_| true, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err("flaky".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::new(5, Duration::from_millis(1));
        let result: Result<(), String> = policy
            .retry("test", None, |e: &String| e != "fatal", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_after_extends_wait() {
        let policy = BackoffPolicy::new(3, Duration::from_millis(10)).without_jitter();
        let limited = LlmError::RateLimited {
            retry_after_ms: Some(2_000),
        };
        assert_eq!(policy.wait_before_retry(0, &limited), Duration::from_secs(2));
        let short = LlmError::RateLimited {
            retry_after_ms: Some(1),
        };
        assert_eq!(policy.wait_before_retry(0, &short), Duration::from_millis(10));
        assert_eq!(policy.wait_before_retry(1, &LlmError::Timeout), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_rate_limited_retry_waits_for_hint() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::new(2, Duration::from_millis(1)).without_jitter();
        let start = Instant::now();
        let result: Result<u32, LlmError> = policy
            .retry("test", None, LlmError::is_transient, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 1 {
                        Err(LlmError::RateLimited {
                            retry_after_ms: Some(60),
                        })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::new(5, Duration::from_secs(30));
        let result: Result<(), String> = policy
            .retry("test", Some(&token), |_| true, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
