//! 消息限流
//!
//! 两道检查：按用户名计的刷屏窗口（固定窗口计数），以及按用户 ID 计的跨房间全局冷却。
//! 两者都由共享存储承载，多实例部署时结果一致。

use std::time::Duration;

use async_trait::async_trait;
use config::RateLimitConfig;
use domain::{UserId, Username};
use redis::aio::ConnectionManager;

use crate::error::ApplicationError;

/// 限流错误类型
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("Flood limit exceeded: {current}/{max} messages in window")]
    FloodExceeded {
        current: u32,
        max: u32,
        retry_after: Duration,
    },

    #[error("Global cooldown active, retry in {}ms", retry_after.as_millis())]
    CooldownActive { retry_after: Duration },
}

/// 单次检查的结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited(RateLimitError),
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// 记录一次发送并检查刷屏窗口
    async fn check_flood(&self, username: &Username) -> Result<RateDecision, ApplicationError>;

    /// 检查并占用全局冷却
    async fn check_cooldown(&self, user_id: UserId) -> Result<RateDecision, ApplicationError>;
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

/// Redis实现：刷屏用 INCR + PEXPIRE，冷却用 SET NX PX
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    config: RateLimitConfig,
}

impl RedisRateLimiter {
    pub fn new(conn: ConnectionManager, config: RateLimitConfig) -> Self {
        Self { conn, config }
    }

    fn flood_key(username: &Username) -> String {
        format!("flood:{}", username)
    }

    fn cooldown_key(user_id: UserId) -> String {
        format!("cooldown:{}", user_id)
    }
}

fn limiter_err(e: redis::RedisError) -> ApplicationError {
    let message = format!("Redis rate limit operation failed: {e}");
    ApplicationError::transient_store_with_source(message, e)
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check_flood(&self, username: &Username) -> Result<RateDecision, ApplicationError> {
        let mut conn = self.conn.clone();
        let key = Self::flood_key(username);
        let window_ms = millis(self.config.flood_window());

        // NX：只在窗口首条消息时设置过期时间
        let (count, ttl_ms): (u32, i64) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&key)
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(window_ms)
            .arg("NX")
            .ignore()
            .cmd("PTTL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(limiter_err)?;

        if count > self.config.flood_max_messages {
            let retry_after = Duration::from_millis(ttl_ms.max(0) as u64);
            return Ok(RateDecision::Limited(RateLimitError::FloodExceeded {
                current: count,
                max: self.config.flood_max_messages,
                retry_after,
            }));
        }
        Ok(RateDecision::Allowed)
    }

    async fn check_cooldown(&self, user_id: UserId) -> Result<RateDecision, ApplicationError> {
        let cooldown_ms = millis(self.config.global_cooldown());
        if cooldown_ms == 0 {
            return Ok(RateDecision::Allowed);
        }

        let mut conn = self.conn.clone();
        let key = Self::cooldown_key(user_id);
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("PX")
            .arg(cooldown_ms)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(limiter_err)?;

        if acquired.is_some() {
            return Ok(RateDecision::Allowed);
        }

        let ttl_ms: i64 = redis::cmd("PTTL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(limiter_err)?;
        Ok(RateDecision::Limited(RateLimitError::CooldownActive {
            retry_after: Duration::from_millis(ttl_ms.max(0) as u64),
        }))
    }
}

/// 内存实现（单实例部署与测试）
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    /// 用户刷屏窗口
    #[derive(Debug, Clone)]
    struct FloodWindow {
        /// 当前时间窗口内的消息数量
        message_count: u32,
        /// 当前时间窗口的开始时间
        window_start: Instant,
    }

    pub struct MemoryRateLimiter {
        config: RateLimitConfig,
        windows: Mutex<HashMap<Username, FloodWindow>>,
        last_sent: Mutex<HashMap<UserId, Instant>>,
    }

    impl MemoryRateLimiter {
        pub fn new(config: RateLimitConfig) -> Self {
            Self {
                config,
                windows: Mutex::new(HashMap::new()),
                last_sent: Mutex::new(HashMap::new()),
            }
        }

        /// 清理过期的窗口与冷却记录
        pub async fn purge_expired(&self) {
            let now = Instant::now();
            let window = self.config.flood_window();
            let cooldown = self.config.global_cooldown();

            self.windows
                .lock()
                .await
                .retain(|_, w| now.duration_since(w.window_start) < window);
            self.last_sent
                .lock()
                .await
                .retain(|_, last| now.duration_since(*last) < cooldown);
        }
    }

    #[async_trait]
    impl RateLimiter for MemoryRateLimiter {
        async fn check_flood(
            &self,
            username: &Username,
        ) -> Result<RateDecision, ApplicationError> {
            let now = Instant::now();
            let window = self.config.flood_window();
            let mut windows = self.windows.lock().await;
            let entry = windows.entry(username.clone()).or_insert(FloodWindow {
                message_count: 0,
                window_start: now,
            });

            // 检查是否需要重置时间窗口
            if now.duration_since(entry.window_start) >= window {
                entry.message_count = 0;
                entry.window_start = now;
            }

            entry.message_count += 1;
            if entry.message_count > self.config.flood_max_messages {
                let retry_after = window.saturating_sub(now.duration_since(entry.window_start));
                return Ok(RateDecision::Limited(RateLimitError::FloodExceeded {
                    current: entry.message_count,
                    max: self.config.flood_max_messages,
                    retry_after,
                }));
            }
            Ok(RateDecision::Allowed)
        }

        async fn check_cooldown(&self, user_id: UserId) -> Result<RateDecision, ApplicationError> {
            let now = Instant::now();
            let cooldown = self.config.global_cooldown();
            let mut last_sent = self.last_sent.lock().await;

            if let Some(last) = last_sent.get(&user_id) {
                let elapsed = now.duration_since(*last);
                if elapsed < cooldown {
                    return Ok(RateDecision::Limited(RateLimitError::CooldownActive {
                        retry_after: cooldown - elapsed,
                    }));
                }
            }
            last_sent.insert(user_id, now);
            Ok(RateDecision::Allowed)
        }
    }
}
