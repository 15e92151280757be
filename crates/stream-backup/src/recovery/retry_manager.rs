use crate::error::{BackupError, Result};
use backoff::ExponentialBackoff;
use std::{fmt, future::Future, time::Duration};
use tracing::{debug, warn};

/// 重试策略
///
/// 第 n 次重试（从1开始）前等待 `min(initial_delay * 2^(n-1), max_delay)`，
/// 不加随机抖动；最多重试 `max_retries` 次，即最多调用 `max_retries + 1` 次。
#[derive(Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 判定错误是否可以重试
    pub is_retryable: fn(&BackupError) -> bool,
}

impl RetryPolicy {
    /// 使用默认可重试判定创建策略
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            is_retryable: default_is_retryable,
        }
    }

    /// 替换可重试判定
    pub fn with_classifier(mut self, is_retryable: fn(&BackupError) -> bool) -> Self {
        self.is_retryable = is_retryable;
        self
    }

    /// 第 `retry` 次重试前的等待时间
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.max_delay,
            max_elapsed_time: None, // 由重试次数而不是总时长来限制
            ..Default::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000), Duration::from_millis(10000))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

/// 默认可重试判定：限流、5xx/服务不可用、传输层错误
pub fn default_is_retryable(err: &BackupError) -> bool {
    err.is_retryable()
}

/// 按重试策略执行一个可能失败的远程调用
///
/// 不可重试的错误原样返回；可重试错误在重试次数用完后包装为
/// [`BackupError::ExhaustedRetry`]。可以安全嵌套使用。
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let policy = *policy;
    let mut attempts = 0u32;

    backoff::future::retry_notify(
        policy.backoff(),
        || {
            attempts += 1;
            let attempt = attempts;
            let call = op();
            async move {
                match call.await {
                    Ok(value) => {
                        if attempt > 1 {
                            debug!("✅ {} 第{}次尝试成功", operation, attempt);
                        }
                        Ok(value)
                    }
                    Err(e) if !(policy.is_retryable)(&e) => Err(backoff::Error::permanent(e)),
                    Err(e) if attempt > policy.max_retries => {
                        Err(backoff::Error::permanent(BackupError::ExhaustedRetry {
                            operation: operation.to_string(),
                            attempts: attempt,
                            source: Box::new(e),
                        }))
                    }
                    Err(e) => Err(backoff::Error::transient(e)),
                }
            }
        },
        |err: BackupError, delay: Duration| {
            warn!("🔄 {} 失败，{:?} 后重试: {}", operation, delay, err);
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    };
    use tokio::time::Instant;

    fn throttled() -> BackupError {
        RemoteError::classify("test:Call", Some("ThrottlingException"), Some(400), "slow down").into()
    }

    fn policy(max_retries: u32, initial_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(initial_ms), Duration::from_millis(max_ms))
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = policy(10, 100, 1000);
        let delays: Vec<u64> = (1..=6).map(|n| policy.delay_for_retry(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);

        // 超大指数不溢出
        assert_eq!(policy.delay_for_retry(64), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_throttled_is_attempted_max_retries_plus_one() {
        let policy = policy(4, 100, 400);
        let calls = Arc::new(Mutex::new(Vec::new()));

        let result: Result<()> = with_retry(&policy, "test:Call", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.lock().unwrap().push(Instant::now());
                Err(throttled())
            }
        })
        .await;

        match result {
            Err(BackupError::ExhaustedRetry { attempts, source, .. }) => {
                assert_eq!(attempts, 5);
                assert!(matches!(*source, BackupError::Remote(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 5);

        let delays: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        let expected = [100u64, 200, 400, 400];
        for (delay, expected_ms) in delays.iter().zip(expected) {
            let expected = Duration::from_millis(expected_ms);
            assert!(*delay >= expected, "{:?} < {:?}", delay, expected);
            assert!(*delay < expected + Duration::from_millis(5), "{:?} vs {:?}", delay, expected);
        }
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d < Duration::from_millis(405)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let policy = policy(5, 10, 100);
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<()> = with_retry(&policy, "test:Call", || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::permanent("test:Call", "access denied").into())
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        match result {
            Err(BackupError::Remote(remote)) => assert_eq!(remote.message, "access denied"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let policy = policy(3, 10, 100);
        let attempts = Arc::new(AtomicU32::new(0));

        let result = with_retry(&policy, "test:Call", || {
            let attempts = Arc::clone(&attempts);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(throttled())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        tokio_test::assert_ok!(&result);
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nested_retries_are_independent() {
        let policy = policy(1, 10, 10);
        let inner_attempts = Arc::new(AtomicU32::new(0));

        let result: Result<u32> = with_retry(&policy, "outer", || {
            let inner_attempts = Arc::clone(&inner_attempts);
            async move {
                with_retry(&policy, "inner", || {
                    let inner_attempts = Arc::clone(&inner_attempts);
                    async move {
                        let n = inner_attempts.fetch_add(1, Ordering::SeqCst);
                        if n % 2 == 0 {
                            Err(throttled())
                        } else {
                            Ok(n)
                        }
                    }
                })
                .await
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(inner_attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        let policy = policy(2, 1, 1).with_classifier(|_| false);
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<()> = with_retry(&policy, "test:Call", || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(throttled())
            }
        })
        .await;

        tokio_test::assert_err!(result);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
