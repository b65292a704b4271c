use async_trait::async_trait;
use domain::{
    BanEntry, BanRepository, ChatMessage, MessageId, MessageRepository, MessageType,
    RepositoryError, RepositoryResult, RewardReason, RewardService, Room, RoomDirectory, RoomId,
    Timestamp, UserId, Username,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use tracing::debug;
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict,
        other => RepositoryError::storage(other.to_string()),
    }
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

#[derive(Debug, FromRow)]
struct RoomRecord {
    id: Uuid,
    name: String,
    description: Option<String>,
    max_users: i32,
    is_private: bool,
    owner_id: Uuid,
    owner_name: Option<String>,
}

impl TryFrom<RoomRecord> for Room {
    type Error = RepositoryError;

    fn try_from(value: RoomRecord) -> Result<Self, Self::Error> {
        let max_users = u32::try_from(value.max_users)
            .map_err(|_| invalid_data(format!("negative max_users for room {}", value.id)))?;
        Ok(Room {
            id: RoomId::from(value.id),
            name: value.name,
            description: value.description,
            max_users,
            is_private: value.is_private,
            owner_id: UserId::from(value.owner_id),
            owner_name: value.owner_name,
        })
    }
}

const ROOM_COLUMNS: &str = r#"
    SELECT r.id, r.name, r.description, r.max_users, r.is_private, r.owner_id, u.username AS owner_name
    FROM rooms r
    LEFT JOIN users u ON u.id = r.owner_id
"#;

pub struct PgRoomDirectory {
    pool: PgPool,
}

impl PgRoomDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomDirectory for PgRoomDirectory {
    async fn find_by_id(&self, room_id: RoomId) -> RepositoryResult<Option<Room>> {
        let record = sqlx::query_as::<_, RoomRecord>(&format!("{ROOM_COLUMNS} WHERE r.id = $1"))
            .bind(Uuid::from(room_id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        record.map(Room::try_from).transpose()
    }

    async fn find_by_name(&self, name: &str) -> RepositoryResult<Option<Room>> {
        let record =
            sqlx::query_as::<_, RoomRecord>(&format!("{ROOM_COLUMNS} WHERE r.name = $1"))
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_err)?;

        record.map(Room::try_from).transpose()
    }

    async fn is_room_admin(&self, room_id: RoomId, user_id: UserId) -> RepositoryResult<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM rooms WHERE id = $1 AND owner_id = $2
                UNION ALL
                SELECT 1 FROM room_admins WHERE room_id = $1 AND user_id = $2
            )
            "#,
        )
        .bind(Uuid::from(room_id))
        .bind(Uuid::from(user_id))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }
}

#[derive(Debug, FromRow)]
struct BanRecord {
    room_id: Uuid,
    user_id: Uuid,
    username: String,
    banned_by: Uuid,
    reason: Option<String>,
    banned_at: Timestamp,
}

impl TryFrom<BanRecord> for BanEntry {
    type Error = RepositoryError;

    fn try_from(value: BanRecord) -> Result<Self, Self::Error> {
        let username =
            Username::parse(value.username).map_err(|err| invalid_data(err.to_string()))?;
        Ok(BanEntry {
            room_id: RoomId::from(value.room_id),
            user_id: UserId::from(value.user_id),
            username,
            banned_by: UserId::from(value.banned_by),
            reason: value.reason,
            banned_at: value.banned_at,
        })
    }
}

pub struct PgBanRepository {
    pool: PgPool,
}

impl PgBanRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BanRepository for PgBanRepository {
    async fn is_banned(
        &self,
        room_id: RoomId,
        user_id: UserId,
        username: &Username,
    ) -> RepositoryResult<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"SELECT EXISTS (SELECT 1 FROM room_bans WHERE room_id = $1 AND (user_id = $2 OR username = $3))"#,
        )
        .bind(Uuid::from(room_id))
        .bind(Uuid::from(user_id))
        .bind(username.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }

    async fn ban(&self, entry: BanEntry) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO room_bans (room_id, user_id, username, banned_by, reason, banned_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (room_id, user_id) DO UPDATE
            SET username = EXCLUDED.username,
                banned_by = EXCLUDED.banned_by,
                reason = EXCLUDED.reason,
                banned_at = EXCLUDED.banned_at
            "#,
        )
        .bind(Uuid::from(entry.room_id))
        .bind(Uuid::from(entry.user_id))
        .bind(entry.username.as_str())
        .bind(Uuid::from(entry.banned_by))
        .bind(entry.reason.as_deref())
        .bind(entry.banned_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn unban(
        &self,
        room_id: RoomId,
        user_id: UserId,
        username: &Username,
    ) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"DELETE FROM room_bans WHERE room_id = $1 AND (user_id = $2 OR username = $3)"#,
        )
        .bind(Uuid::from(room_id))
        .bind(Uuid::from(user_id))
        .bind(username.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_bans(&self, room_id: RoomId) -> RepositoryResult<Vec<BanEntry>> {
        let records = sqlx::query_as::<_, BanRecord>(
            r#"
            SELECT room_id, user_id, username, banned_by, reason, banned_at
            FROM room_bans WHERE room_id = $1
            ORDER BY banned_at DESC
            "#,
        )
        .bind(Uuid::from(room_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(BanEntry::try_from).collect()
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    room_id: Uuid,
    user_id: Option<Uuid>,
    username: String,
    content: String,
    message_type: String,
    created_at: Timestamp,
}

impl TryFrom<MessageRecord> for ChatMessage {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let message_type = MessageType::parse(&value.message_type)
            .map_err(|err| invalid_data(err.to_string()))?;
        Ok(ChatMessage {
            id: MessageId::from(value.id),
            room_id: RoomId::from(value.room_id),
            user_id: value.user_id.map(UserId::from),
            username: value.username,
            message: value.content,
            message_type,
            timestamp: value.created_at,
        })
    }
}

pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn insert(&self, message: &ChatMessage) -> RepositoryResult<ChatMessage> {
        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            INSERT INTO messages (id, room_id, user_id, username, content, message_type, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, room_id, user_id, username, content, message_type, created_at
            "#,
        )
        .bind(Uuid::from(message.id))
        .bind(Uuid::from(message.room_id))
        .bind(message.user_id.map(Uuid::from))
        .bind(&message.username)
        .bind(&message.message)
        .bind(message.message_type.as_str())
        .bind(message.timestamp)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        ChatMessage::try_from(record)
    }

    async fn delete(&self, message_id: MessageId) -> RepositoryResult<bool> {
        let result = sqlx::query(r#"DELETE FROM messages WHERE id = $1"#)
            .bind(Uuid::from(message_id))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(
        &self,
        room_id: RoomId,
        limit: u32,
        offset: u32,
    ) -> RepositoryResult<Vec<ChatMessage>> {
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT id, room_id, user_id, username, content, message_type, created_at
            FROM messages
            WHERE room_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(Uuid::from(room_id))
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(ChatMessage::try_from).collect()
    }
}

/// 经验值直接累加到 users.xp，等级计算由外部系统负责
pub struct PgRewardService {
    pool: PgPool,
}

impl PgRewardService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RewardService for PgRewardService {
    async fn grant(
        &self,
        user_id: UserId,
        amount: u32,
        reason: RewardReason,
    ) -> RepositoryResult<()> {
        let result = sqlx::query(r#"UPDATE users SET xp = xp + $2 WHERE id = $1"#)
            .bind(Uuid::from(user_id))
            .bind(i64::from(amount))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            debug!(user_id = %user_id, reason = %reason, "用户不存在，跳过经验发放");
        }
        Ok(())
    }
}

/// Postgres 协作者集合
#[derive(Clone)]
pub struct PgStorage {
    pub pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn room_directory(&self) -> PgRoomDirectory {
        PgRoomDirectory::new(self.pool.clone())
    }

    pub fn ban_repository(&self) -> PgBanRepository {
        PgBanRepository::new(self.pool.clone())
    }

    pub fn message_repository(&self) -> PgMessageRepository {
        PgMessageRepository::new(self.pool.clone())
    }

    pub fn reward_service(&self) -> PgRewardService {
        PgRewardService::new(self.pool.clone())
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
