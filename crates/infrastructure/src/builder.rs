use std::sync::Arc;
use std::time::Duration;

use application::presence::memory::MemoryPresenceStore;
use application::rate_limiter::memory::MemoryRateLimiter;
use application::{PresenceStore, RateLimiter, RedisPresenceStore, RedisRateLimiter};
use config::AppConfig;
use domain::entities::room::DEFAULT_MAX_USERS;
use domain::{
    BanRepository, MessageRepository, RewardService, Room, RoomDirectory, RoomId, UserId,
};
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    memory::{
        MemoryBanRepository, MemoryMessageRepository, MemoryRewardService, MemoryRoomDirectory,
    },
    migrations::MIGRATOR,
    repository::{create_pg_pool, PgStorage},
};

/// 开发模式下预置大厅的固定ID
pub const LOBBY_ROOM_ID: Uuid = Uuid::from_u128(1);

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// 组装好的持久化协作者与在线状态存储
#[derive(Clone)]
pub struct Infrastructure {
    pub directory: Arc<dyn RoomDirectory>,
    pub bans: Arc<dyn BanRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub rewards: Arc<dyn RewardService>,
    pub presence: Arc<dyn PresenceStore>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    /// 内存限流器需要定期清理
    memory_rate_limiter: Option<Arc<MemoryRateLimiter>>,
}

impl Infrastructure {
    /// 按配置选择后端：有数据库 URL 用 Postgres，有 Redis URL 用 Redis，否则退回内存实现
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let mut infra = match &config.database.url {
            Some(url) => {
                let pool = create_pg_pool(url, config.database.max_connections).await?;
                MIGRATOR.run(&pool).await?;
                info!("已连接 Postgres 并完成迁移");
                Self::with_postgres(PgStorage::new(pool), config)
            }
            None => {
                warn!(lobby_id = %LOBBY_ROOM_ID, "未配置数据库，使用内存协作者（开发模式）");
                Self::in_memory(config)
            }
        };

        if let Some(url) = &config.redis.url {
            let client = redis::Client::open(url.as_str())?;
            let conn = ConnectionManager::new(client).await?;
            infra.presence = Arc::new(RedisPresenceStore::new(
                conn.clone(),
                config.presence.clone(),
            ));
            infra.rate_limiter = Arc::new(RedisRateLimiter::new(conn, config.rate_limit.clone()));
            infra.memory_rate_limiter = None;
            info!("在线状态与限流使用 Redis");
        } else {
            warn!("未配置 Redis，在线状态与限流使用内存实现");
        }

        Ok(infra)
    }

    /// 全内存后端，预置一个 Lobby 房间
    pub fn in_memory(config: &AppConfig) -> Self {
        let lobby = Room {
            id: RoomId::from(LOBBY_ROOM_ID),
            name: "Lobby".to_string(),
            description: Some("Default room".to_string()),
            max_users: DEFAULT_MAX_USERS,
            is_private: false,
            owner_id: UserId::from(Uuid::nil()),
            owner_name: None,
        };
        let (presence, rate_limiter, memory_rate_limiter) = memory_stores(config);

        Self {
            directory: Arc::new(MemoryRoomDirectory::with_rooms([lobby])),
            bans: Arc::new(MemoryBanRepository::default()),
            messages: Arc::new(MemoryMessageRepository::default()),
            rewards: Arc::new(MemoryRewardService::default()),
            presence,
            rate_limiter,
            memory_rate_limiter: Some(memory_rate_limiter),
        }
    }

    fn with_postgres(storage: PgStorage, config: &AppConfig) -> Self {
        let (presence, rate_limiter, memory_rate_limiter) = memory_stores(config);

        Self {
            directory: Arc::new(storage.room_directory()),
            bans: Arc::new(storage.ban_repository()),
            messages: Arc::new(storage.message_repository()),
            rewards: Arc::new(storage.reward_service()),
            presence,
            rate_limiter,
            memory_rate_limiter: Some(memory_rate_limiter),
        }
    }

    /// 定期清理内存限流窗口，Redis 后端依赖键过期，无需任务
    pub fn spawn_maintenance(&self, interval: Duration) -> Option<JoinHandle<()>> {
        let limiter = self.memory_rate_limiter.clone()?;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                limiter.purge_expired().await;
            }
        }))
    }
}

fn memory_stores(
    config: &AppConfig,
) -> (
    Arc<dyn PresenceStore>,
    Arc<dyn RateLimiter>,
    Arc<MemoryRateLimiter>,
) {
    let limiter = Arc::new(MemoryRateLimiter::new(config.rate_limit.clone()));
    (
        Arc::new(MemoryPresenceStore::new(config.presence.clone())),
        limiter.clone(),
        limiter,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dev_mode_seeds_lobby() {
        let infra = Infrastructure::connect(&AppConfig::default()).await.unwrap();
        let lobby = infra
            .directory
            .find_by_id(RoomId::from(LOBBY_ROOM_ID))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lobby.name, "Lobby");
        assert_eq!(lobby.manager_name(), "admin");
        assert!(infra.spawn_maintenance(Duration::from_secs(60)).is_some());
    }
}
