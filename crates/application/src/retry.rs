use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::error::ApplicationError;

#[derive(Clone, Debug)]
pub enum Backoff {
    Exponential { base: Duration },
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base }
    }

    fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base } => {
                let exp = std::cmp::min(attempt.saturating_sub(1), 20);
                let factor = 1u32 << exp;
                base.saturating_mul(factor)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryConfig {
    /// 在线状态存储调用：失败后原地重试一次
    pub fn store_default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Backoff::exponential(Duration::from_millis(25)),
        }
    }
}

/// 仅对暂时性错误重试，其余错误立即返回
pub async fn retry_async<F, Fut, T>(config: &RetryConfig, mut op: F) -> Result<T, ApplicationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApplicationError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= config.max_attempts || !e.is_transient() {
                    return Err(e);
                }
                tracing::warn!(attempt, error = %e, "在线状态存储调用失败，准备重试");
                sleep(config.backoff.delay_at(attempt)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_once() {
        let calls = AtomicU32::new(0);
        let result = retry_async(&RetryConfig::store_default(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ApplicationError::transient_store("blip"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_async(&RetryConfig::store_default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApplicationError::transient_store("down")) }
        })
        .await;

        assert!(matches!(result, Err(ApplicationError::TransientStore { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_async(&RetryConfig::store_default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApplicationError::RoomFull) }
        })
        .await;

        assert!(matches!(result, Err(ApplicationError::RoomFull)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exponential_delays_double() {
        let backoff = Backoff::exponential(Duration::from_millis(10));
        assert_eq!(backoff.delay_at(1), Duration::from_millis(10));
        assert_eq!(backoff.delay_at(3), Duration::from_millis(40));
    }
}
