//! 房间在线状态存储
//!
//! 权威的“谁在房间里”记录，多实例共享。Redis 布局：
//! - `room:{id}:presence`：ZSET，成员为用户名，分值为加入时间（毫秒）
//! - `user:{name}:rooms`：SET，用户所在房间
//! - `presence:{name}`：用户状态，带 TTL
//! - `room:{id}:lastmsg`：HASH，房间最后一条消息
//! - `room:{id}:notices`：LIST，最近的系统通知

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use config::PresenceConfig;
use domain::{LastMessage, PresenceEntry, RoomId, Timestamp, UserStatus, Username};
use redis::aio::ConnectionManager;
use redis::Script;
use uuid::Uuid;

use crate::error::ApplicationError;

/// 有界加入的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added { population: u64 },
    AlreadyPresent { population: u64 },
    Full { population: u64 },
}

impl AddOutcome {
    pub fn population(&self) -> u64 {
        match *self {
            AddOutcome::Added { population }
            | AddOutcome::AlreadyPresent { population }
            | AddOutcome::Full { population } => population,
        }
    }
}

/// 移除结果，`removed` 为 false 时调用方不应广播离开事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub removed: bool,
    pub population: u64,
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// 原子地检查容量并加入：已在房间、已满、加入成功三者之一
    async fn add_member(
        &self,
        room_id: RoomId,
        username: &Username,
        capacity: u32,
        joined_at: Timestamp,
    ) -> Result<AddOutcome, ApplicationError>;

    async fn remove_member(
        &self,
        room_id: RoomId,
        username: &Username,
    ) -> Result<RemoveOutcome, ApplicationError>;

    /// 按加入时间排序的在线列表
    async fn members(&self, room_id: RoomId) -> Result<Vec<PresenceEntry>, ApplicationError>;

    async fn population(&self, room_id: RoomId) -> Result<u64, ApplicationError>;

    async fn is_member(&self, room_id: RoomId, username: &Username)
        -> Result<bool, ApplicationError>;

    /// 用户所在房间，按房间 ID 排序
    async fn user_rooms(&self, username: &Username) -> Result<Vec<RoomId>, ApplicationError>;

    async fn set_status(
        &self,
        username: &Username,
        status: UserStatus,
    ) -> Result<(), ApplicationError>;

    /// 状态键不存在或已过期时为离线
    async fn status(&self, username: &Username) -> Result<UserStatus, ApplicationError>;

    async fn statuses(&self, usernames: &[Username]) -> Result<Vec<UserStatus>, ApplicationError>;

    async fn clear_status(&self, username: &Username) -> Result<(), ApplicationError>;

    async fn set_last_message(
        &self,
        room_id: RoomId,
        last: &LastMessage,
    ) -> Result<(), ApplicationError>;

    async fn last_message(&self, room_id: RoomId)
        -> Result<Option<LastMessage>, ApplicationError>;

    async fn push_notice(&self, room_id: RoomId, notice: &str) -> Result<(), ApplicationError>;

    /// 最近的系统通知，按时间先后排列
    async fn recent_notices(&self, room_id: RoomId) -> Result<Vec<String>, ApplicationError>;
}

// KEYS: 房间在线集合, 用户房间集合
// ARGV: 用户名, 容量, 加入时间, 房间ID, 过期秒数
// 返回 {状态, 人数}，状态 0=加入 1=已在房间 2=已满
const ADD_MEMBER_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  return {1, redis.call('ZCARD', KEYS[1])}
end
local count = redis.call('ZCARD', KEYS[1])
if count >= tonumber(ARGV[2]) then
  return {2, count}
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[4])
redis.call('EXPIRE', KEYS[1], ARGV[5])
redis.call('EXPIRE', KEYS[2], ARGV[5])
return {0, count + 1}
"#;

// KEYS: 房间在线集合, 用户房间集合
// ARGV: 用户名, 房间ID
const REMOVE_MEMBER_SCRIPT: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('SREM', KEYS[2], ARGV[2])
return {removed, redis.call('ZCARD', KEYS[1])}
"#;

/// Redis实现的在线状态存储
pub struct RedisPresenceStore {
    conn: ConnectionManager,
    config: PresenceConfig,
    add_script: Script,
    remove_script: Script,
}

impl RedisPresenceStore {
    pub fn new(conn: ConnectionManager, config: PresenceConfig) -> Self {
        Self {
            conn,
            config,
            add_script: Script::new(ADD_MEMBER_SCRIPT),
            remove_script: Script::new(REMOVE_MEMBER_SCRIPT),
        }
    }

    /// 生成房间在线集合的Redis键
    fn room_presence_key(room_id: RoomId) -> String {
        format!("room:{}:presence", room_id)
    }

    /// 生成用户所在房间集合的Redis键
    fn user_rooms_key(username: &Username) -> String {
        format!("user:{}:rooms", username)
    }

    fn status_key(username: &Username) -> String {
        format!("presence:{}", username)
    }

    fn last_message_key(room_id: RoomId) -> String {
        format!("room:{}:lastmsg", room_id)
    }

    fn notices_key(room_id: RoomId) -> String {
        format!("room:{}:notices", room_id)
    }
}

fn store_err(e: redis::RedisError) -> ApplicationError {
    let message = format!("Redis operation failed: {e}");
    ApplicationError::transient_store_with_source(message, e)
}

fn parse_status(raw: Option<String>) -> UserStatus {
    match raw {
        Some(value) => value.parse().unwrap_or_else(|_| {
            tracing::warn!(status = %value, "Redis中存在未知的用户状态");
            UserStatus::Offline
        }),
        None => UserStatus::Offline,
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn add_member(
        &self,
        room_id: RoomId,
        username: &Username,
        capacity: u32,
        joined_at: Timestamp,
    ) -> Result<AddOutcome, ApplicationError> {
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .add_script
            .key(Self::room_presence_key(room_id))
            .key(Self::user_rooms_key(username))
            .arg(username.as_str())
            .arg(capacity)
            .arg(joined_at.timestamp_millis())
            .arg(room_id.to_string())
            .arg(self.config.membership_ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        let (code, population) = match reply.as_slice() {
            [code, population] => (*code, *population as u64),
            _ => {
                return Err(ApplicationError::transient_store(format!(
                    "unexpected reply from add script: {reply:?}"
                )))
            }
        };

        let outcome = match code {
            0 => AddOutcome::Added { population },
            1 => AddOutcome::AlreadyPresent { population },
            _ => AddOutcome::Full { population },
        };

        tracing::debug!(room_id = %room_id, username = %username, ?outcome, "有界加入");
        Ok(outcome)
    }

    async fn remove_member(
        &self,
        room_id: RoomId,
        username: &Username,
    ) -> Result<RemoveOutcome, ApplicationError> {
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .remove_script
            .key(Self::room_presence_key(room_id))
            .key(Self::user_rooms_key(username))
            .arg(username.as_str())
            .arg(room_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        match reply.as_slice() {
            [removed, population] => Ok(RemoveOutcome {
                removed: *removed > 0,
                population: *population as u64,
            }),
            _ => Err(ApplicationError::transient_store(format!(
                "unexpected reply from remove script: {reply:?}"
            ))),
        }
    }

    async fn members(&self, room_id: RoomId) -> Result<Vec<PresenceEntry>, ApplicationError> {
        let mut conn = self.conn.clone();
        let raw: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(Self::room_presence_key(room_id))
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;

        let mut entries = Vec::with_capacity(raw.len());
        for (name, score) in raw {
            let username = match Username::parse(name) {
                Ok(username) => username,
                Err(err) => {
                    tracing::warn!(room_id = %room_id, error = %err, "跳过非法的在线成员");
                    continue;
                }
            };
            let joined_at = DateTime::from_timestamp_millis(score as i64).unwrap_or_else(Utc::now);
            entries.push(PresenceEntry {
                room_id,
                username,
                joined_at,
            });
        }
        Ok(entries)
    }

    async fn population(&self, room_id: RoomId) -> Result<u64, ApplicationError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCARD")
            .arg(Self::room_presence_key(room_id))
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn is_member(
        &self,
        room_id: RoomId,
        username: &Username,
    ) -> Result<bool, ApplicationError> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(Self::room_presence_key(room_id))
            .arg(username.as_str())
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(score.is_some())
    }

    async fn user_rooms(&self, username: &Username) -> Result<Vec<RoomId>, ApplicationError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(Self::user_rooms_key(username))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;

        // 将字符串转换为RoomId
        let mut room_ids: Vec<RoomId> = members
            .into_iter()
            .map(|s| s.parse::<Uuid>().map(RoomId::from))
            .collect::<Result<_, _>>()
            .map_err(|e| {
                let message = format!("Invalid UUID in Redis: {e}");
                ApplicationError::transient_store_with_source(message, e)
            })?;
        room_ids.sort();
        Ok(room_ids)
    }

    async fn set_status(
        &self,
        username: &Username,
        status: UserStatus,
    ) -> Result<(), ApplicationError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::status_key(username))
            .arg(status.as_str())
            .arg("EX")
            .arg(self.config.status_ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn status(&self, username: &Username) -> Result<UserStatus, ApplicationError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::status_key(username))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(parse_status(raw))
    }

    async fn statuses(&self, usernames: &[Username]) -> Result<Vec<UserStatus>, ApplicationError> {
        if usernames.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = usernames.iter().map(Self::status_key).collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(raw.into_iter().map(parse_status).collect())
    }

    async fn clear_status(&self, username: &Username) -> Result<(), ApplicationError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(Self::status_key(username))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn set_last_message(
        &self,
        room_id: RoomId,
        last: &LastMessage,
    ) -> Result<(), ApplicationError> {
        let mut conn = self.conn.clone();
        let key = Self::last_message_key(room_id);
        let _: () = redis::pipe()
            .cmd("HSET")
            .arg(&key)
            .arg("message")
            .arg(&last.message)
            .arg("username")
            .arg(&last.username)
            .arg("timestamp")
            .arg(last.timestamp.to_rfc3339())
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.config.membership_ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn last_message(
        &self,
        room_id: RoomId,
    ) -> Result<Option<LastMessage>, ApplicationError> {
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> = redis::cmd("HGETALL")
            .arg(Self::last_message_key(room_id))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;

        let (Some(message), Some(username), Some(timestamp)) = (
            fields.get("message"),
            fields.get("username"),
            fields.get("timestamp"),
        ) else {
            return Ok(None);
        };

        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| {
                let message = format!("Invalid timestamp in Redis: {e}");
                ApplicationError::transient_store_with_source(message, e)
            })?;

        Ok(Some(LastMessage {
            message: message.clone(),
            username: username.clone(),
            timestamp,
        }))
    }

    async fn push_notice(&self, room_id: RoomId, notice: &str) -> Result<(), ApplicationError> {
        let mut conn = self.conn.clone();
        let key = Self::notices_key(room_id);
        let keep = self.config.notice_log_size.max(1) as isize - 1;
        let _: () = redis::pipe()
            .cmd("LPUSH")
            .arg(&key)
            .arg(notice)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(keep)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.config.membership_ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn recent_notices(&self, room_id: RoomId) -> Result<Vec<String>, ApplicationError> {
        let mut conn = self.conn.clone();
        let mut notices: Vec<String> = redis::cmd("LRANGE")
            .arg(Self::notices_key(room_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        notices.reverse();
        Ok(notices)
    }
}

/// 内存实现的在线状态存储（单实例部署与测试）
pub mod memory {
    use super::*;
    use std::collections::{BTreeSet, HashMap, VecDeque};
    use tokio::sync::RwLock;
    use tokio::time::Instant;

    #[derive(Default)]
    struct State {
        rooms: HashMap<RoomId, Vec<PresenceEntry>>,
        user_rooms: HashMap<Username, BTreeSet<RoomId>>,
        statuses: HashMap<Username, (UserStatus, Instant)>,
        last_messages: HashMap<RoomId, LastMessage>,
        notices: HashMap<RoomId, VecDeque<String>>,
    }

    impl State {
        fn live_status(&self, username: &Username) -> UserStatus {
            match self.statuses.get(username) {
                Some((status, expires_at)) if *expires_at > Instant::now() => *status,
                _ => UserStatus::Offline,
            }
        }
    }

    /// 单把锁保护全部状态，有界加入因此是原子的
    pub struct MemoryPresenceStore {
        state: RwLock<State>,
        config: PresenceConfig,
    }

    impl Default for MemoryPresenceStore {
        fn default() -> Self {
            Self::new(PresenceConfig::default())
        }
    }

    impl MemoryPresenceStore {
        pub fn new(config: PresenceConfig) -> Self {
            Self {
                state: RwLock::new(State::default()),
                config,
            }
        }
    }

    #[async_trait]
    impl PresenceStore for MemoryPresenceStore {
        async fn add_member(
            &self,
            room_id: RoomId,
            username: &Username,
            capacity: u32,
            joined_at: Timestamp,
        ) -> Result<AddOutcome, ApplicationError> {
            let mut state = self.state.write().await;
            let members = state.rooms.entry(room_id).or_default();
            let population = members.len() as u64;

            if members.iter().any(|entry| &entry.username == username) {
                return Ok(AddOutcome::AlreadyPresent { population });
            }
            if population >= u64::from(capacity) {
                return Ok(AddOutcome::Full { population });
            }

            members.push(PresenceEntry {
                room_id,
                username: username.clone(),
                joined_at,
            });
            state
                .user_rooms
                .entry(username.clone())
                .or_default()
                .insert(room_id);

            Ok(AddOutcome::Added {
                population: population + 1,
            })
        }

        async fn remove_member(
            &self,
            room_id: RoomId,
            username: &Username,
        ) -> Result<RemoveOutcome, ApplicationError> {
            let mut state = self.state.write().await;

            let mut removed = false;
            let mut population = 0;
            if let Some(members) = state.rooms.get_mut(&room_id) {
                let before = members.len();
                members.retain(|entry| &entry.username != username);
                removed = members.len() != before;
                population = members.len() as u64;
                if members.is_empty() {
                    state.rooms.remove(&room_id);
                }
            }

            if let Some(rooms) = state.user_rooms.get_mut(username) {
                rooms.remove(&room_id);
                if rooms.is_empty() {
                    state.user_rooms.remove(username);
                }
            }

            Ok(RemoveOutcome {
                removed,
                population,
            })
        }

        async fn members(&self, room_id: RoomId) -> Result<Vec<PresenceEntry>, ApplicationError> {
            let state = self.state.read().await;
            Ok(state.rooms.get(&room_id).cloned().unwrap_or_default())
        }

        async fn population(&self, room_id: RoomId) -> Result<u64, ApplicationError> {
            let state = self.state.read().await;
            Ok(state.rooms.get(&room_id).map_or(0, |m| m.len() as u64))
        }

        async fn is_member(
            &self,
            room_id: RoomId,
            username: &Username,
        ) -> Result<bool, ApplicationError> {
            let state = self.state.read().await;
            Ok(state
                .rooms
                .get(&room_id)
                .is_some_and(|m| m.iter().any(|entry| &entry.username == username)))
        }

        async fn user_rooms(&self, username: &Username) -> Result<Vec<RoomId>, ApplicationError> {
            let state = self.state.read().await;
            Ok(state
                .user_rooms
                .get(username)
                .map(|rooms| rooms.iter().copied().collect())
                .unwrap_or_default())
        }

        async fn set_status(
            &self,
            username: &Username,
            status: UserStatus,
        ) -> Result<(), ApplicationError> {
            let expires_at = Instant::now() + self.config.status_ttl();
            self.state
                .write()
                .await
                .statuses
                .insert(username.clone(), (status, expires_at));
            Ok(())
        }

        async fn status(&self, username: &Username) -> Result<UserStatus, ApplicationError> {
            Ok(self.state.read().await.live_status(username))
        }

        async fn statuses(
            &self,
            usernames: &[Username],
        ) -> Result<Vec<UserStatus>, ApplicationError> {
            let state = self.state.read().await;
            Ok(usernames.iter().map(|u| state.live_status(u)).collect())
        }

        async fn clear_status(&self, username: &Username) -> Result<(), ApplicationError> {
            self.state.write().await.statuses.remove(username);
            Ok(())
        }

        async fn set_last_message(
            &self,
            room_id: RoomId,
            last: &LastMessage,
        ) -> Result<(), ApplicationError> {
            self.state
                .write()
                .await
                .last_messages
                .insert(room_id, last.clone());
            Ok(())
        }

        async fn last_message(
            &self,
            room_id: RoomId,
        ) -> Result<Option<LastMessage>, ApplicationError> {
            Ok(self.state.read().await.last_messages.get(&room_id).cloned())
        }

        async fn push_notice(&self, room_id: RoomId, notice: &str) -> Result<(), ApplicationError> {
            let limit = self.config.notice_log_size.max(1);
            let mut state = self.state.write().await;
            let log = state.notices.entry(room_id).or_default();
            log.push_back(notice.to_string());
            while log.len() > limit {
                log.pop_front();
            }
            Ok(())
        }

        async fn recent_notices(&self, room_id: RoomId) -> Result<Vec<String>, ApplicationError> {
            let state = self.state.read().await;
            Ok(state
                .notices
                .get(&room_id)
                .map(|log| log.iter().cloned().collect())
                .unwrap_or_default())
        }
    }
}
