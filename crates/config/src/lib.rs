//! 统一配置中心
//!
//! 提供中继服务的全局配置管理，包括：
//! - 服务监听地址
//! - 数据库与 Redis 连接
//! - JWT 校验
//! - 在线状态、限流、消息中继的可调参数
//!
//! 加载顺序：内置默认值 -> 可选 YAML 文件（`RELAY_CONFIG_FILE`）-> `RELAY_` 前缀环境变量，
//! 嵌套字段使用双下划线分隔，例如 `RELAY_RATE_LIMIT__FLOOD_MAX_MESSAGES=10`。

use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// 配置文件路径环境变量
pub const CONFIG_FILE_ENV: &str = "RELAY_CONFIG_FILE";
/// 环境变量前缀
pub const ENV_PREFIX: &str = "RELAY_";

/// 全局应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务配置
    pub server: ServerConfig,
    /// 数据库配置，未配置 url 时使用内存协作者
    pub database: DatabaseConfig,
    /// Redis配置，未配置 url 时使用内存在线状态存储
    pub redis: RedisConfig,
    /// JWT配置
    pub jwt: JwtConfig,
    /// 在线状态配置
    pub presence: PresenceConfig,
    /// 限流配置
    pub rate_limit: RateLimitConfig,
    /// 消息中继配置
    pub relay: RelayConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

/// Redis配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: Option<String>,
}

/// JWT配置
///
/// 令牌由外部认证服务签发，这里只负责校验。
/// 未配置 secret 时进入开发模式，WebSocket 直接信任查询参数中的身份。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: Option<String>,
}

/// 在线状态配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// 用户状态键的存活时间（秒），无续期时自动视为离线
    pub status_ttl_secs: u64,
    /// 房间/用户成员集合的存活时间（秒），用于崩溃恢复
    pub membership_ttl_secs: u64,
    /// 每个房间保留的系统通知条数
    pub notice_log_size: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            status_ttl_secs: 120,
            membership_ttl_secs: 86_400,
            notice_log_size: 50,
        }
    }
}

impl PresenceConfig {
    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn membership_ttl(&self) -> Duration {
        Duration::from_secs(self.membership_ttl_secs)
    }
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 刷屏检测窗口（毫秒）
    pub flood_window_ms: u64,
    /// 窗口内允许的最大消息数
    pub flood_max_messages: u32,
    /// 同一用户两条消息之间的最小间隔（毫秒），跨房间生效
    pub global_cooldown_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            flood_window_ms: 3_000,
            flood_max_messages: 5,
            global_cooldown_ms: 500,
        }
    }
}

impl RateLimitConfig {
    pub fn flood_window(&self) -> Duration {
        Duration::from_millis(self.flood_window_ms)
    }

    pub fn global_cooldown(&self) -> Duration {
        Duration::from_millis(self.global_cooldown_ms)
    }
}

/// 消息中继配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub max_message_length: usize,
    /// 应用层重连宽限期（毫秒），只作用于主动挂起的会话
    pub reconnect_grace_ms: u64,
    pub join_reward: u32,
    pub message_reward: u32,
    pub history_default_limit: u32,
    pub history_max_limit: u32,
    /// 每个会话出站队列容量
    pub outbound_queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_message_length: 1000,
            reconnect_grace_ms: 15_000,
            join_reward: 5,
            message_reward: 1,
            history_default_limit: 50,
            history_max_limit: 100,
            outbound_queue_capacity: 256,
        }
    }
}

impl RelayConfig {
    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms)
    }
}

impl AppConfig {
    /// 按默认值 -> 配置文件 -> 环境变量的顺序加载并校验
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            figment = figment.merge(Yaml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment
            .extract()
            .map_err(|err| ConfigError::Load(Box::new(err)))?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidServerConfig(
                "port must be greater than 0".to_string(),
            ));
        }

        if let Some(url) = &self.database.url {
            if url.is_empty() {
                return Err(ConfigError::InvalidDatabaseConfig(
                    "database url cannot be empty".to_string(),
                ));
            }
            if self.database.max_connections == 0 {
                return Err(ConfigError::InvalidDatabaseConfig(
                    "max connections must be greater than 0".to_string(),
                ));
            }
        }

        if let Some(secret) = &self.jwt.secret {
            if secret.len() < 32 {
                return Err(ConfigError::InvalidJwtSecret(
                    "JWT secret must be at least 32 characters long".to_string(),
                ));
            }
        }

        if self.rate_limit.flood_window_ms == 0 || self.rate_limit.flood_max_messages == 0 {
            return Err(ConfigError::InvalidRateLimit(
                "flood window and message limit must be greater than 0".to_string(),
            ));
        }

        if self.presence.status_ttl_secs == 0 || self.presence.membership_ttl_secs == 0 {
            return Err(ConfigError::InvalidPresenceConfig(
                "presence TTLs must be greater than 0".to_string(),
            ));
        }

        if self.relay.max_message_length == 0
            || self.relay.history_max_limit == 0
            || self.relay.history_default_limit > self.relay.history_max_limit
        {
            return Err(ConfigError::InvalidRelayConfig(
                "message length and history limits are inconsistent".to_string(),
            ));
        }

        if self.relay.outbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidRelayConfig(
                "outbound queue capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[source] Box<figment::Error>),
    #[error("Invalid server configuration: {0}")]
    InvalidServerConfig(String),
    #[error("Invalid database configuration: {0}")]
    InvalidDatabaseConfig(String),
    #[error("Invalid JWT secret: {0}")]
    InvalidJwtSecret(String),
    #[error("Invalid rate limit configuration: {0}")]
    InvalidRateLimit(String),
    #[error("Invalid presence configuration: {0}")]
    InvalidPresenceConfig(String),
    #[error("Invalid relay configuration: {0}")]
    InvalidRelayConfig(String),
}
