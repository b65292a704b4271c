//! 内存版持久化协作者
//!
//! 未配置数据库时的开发模式以及 Web 层集成测试使用。进程退出即丢失。

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use domain::{
    BanEntry, BanRepository, ChatMessage, MessageId, MessageRepository, RepositoryResult,
    RewardReason, RewardService, Room, RoomDirectory, RoomId, UserId, Username,
};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
pub struct MemoryRoomDirectory {
    rooms: RwLock<HashMap<RoomId, Room>>,
    admins: RwLock<HashSet<(RoomId, UserId)>>,
}

impl MemoryRoomDirectory {
    pub fn with_rooms(rooms: impl IntoIterator<Item = Room>) -> Self {
        Self {
            rooms: RwLock::new(rooms.into_iter().map(|room| (room.id, room)).collect()),
            admins: RwLock::default(),
        }
    }

    pub async fn insert(&self, room: Room) {
        self.rooms.write().await.insert(room.id, room);
    }

    pub async fn grant_admin(&self, room_id: RoomId, user_id: UserId) {
        self.admins.write().await.insert((room_id, user_id));
    }

    pub async fn rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.rooms.read().await.values().cloned().collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        rooms
    }
}

#[async_trait]
impl RoomDirectory for MemoryRoomDirectory {
    async fn find_by_id(&self, room_id: RoomId) -> RepositoryResult<Option<Room>> {
        Ok(self.rooms.read().await.get(&room_id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> RepositoryResult<Option<Room>> {
        Ok(self
            .rooms
            .read()
            .await
            .values()
            .find(|room| room.name == name)
            .cloned())
    }

    async fn is_room_admin(&self, room_id: RoomId, user_id: UserId) -> RepositoryResult<bool> {
        let is_owner = self
            .rooms
            .read()
            .await
            .get(&room_id)
            .is_some_and(|room| room.owner_id == user_id);
        Ok(is_owner || self.admins.read().await.contains(&(room_id, user_id)))
    }
}

#[derive(Default)]
pub struct MemoryBanRepository {
    entries: RwLock<Vec<BanEntry>>,
}

fn matches_ban(entry: &BanEntry, room_id: RoomId, user_id: UserId, username: &Username) -> bool {
    entry.room_id == room_id && (entry.user_id == user_id || &entry.username == username)
}

#[async_trait]
impl BanRepository for MemoryBanRepository {
    async fn is_banned(
        &self,
        room_id: RoomId,
        user_id: UserId,
        username: &Username,
    ) -> RepositoryResult<bool> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .any(|entry| matches_ban(entry, room_id, user_id, username)))
    }

    async fn ban(&self, entry: BanEntry) -> RepositoryResult<()> {
        let mut entries = self.entries.write().await;
        entries.retain(|existing| {
            !(existing.room_id == entry.room_id && existing.user_id == entry.user_id)
        });
        entries.push(entry);
        Ok(())
    }

    async fn unban(
        &self,
        room_id: RoomId,
        user_id: UserId,
        username: &Username,
    ) -> RepositoryResult<bool> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|entry| !matches_ban(entry, room_id, user_id, username));
        Ok(entries.len() != before)
    }

    async fn list_bans(&self, room_id: RoomId) -> RepositoryResult<Vec<BanEntry>> {
        let mut bans: Vec<BanEntry> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|entry| entry.room_id == room_id)
            .cloned()
            .collect();
        bans.sort_by(|a, b| b.banned_at.cmp(&a.banned_at));
        Ok(bans)
    }
}

/// 按房间保存消息，插入顺序即时间顺序
#[derive(Default)]
pub struct MemoryMessageRepository {
    rooms: RwLock<HashMap<RoomId, Vec<ChatMessage>>>,
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn insert(&self, message: &ChatMessage) -> RepositoryResult<ChatMessage> {
        self.rooms
            .write()
            .await
            .entry(message.room_id)
            .or_default()
            .push(message.clone());
        Ok(message.clone())
    }

    async fn delete(&self, message_id: MessageId) -> RepositoryResult<bool> {
        let mut rooms = self.rooms.write().await;
        for messages in rooms.values_mut() {
            if let Some(index) = messages.iter().position(|m| m.id == message_id) {
                messages.remove(index);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn list(
        &self,
        room_id: RoomId,
        limit: u32,
        offset: u32,
    ) -> RepositoryResult<Vec<ChatMessage>> {
        let rooms = self.rooms.read().await;
        Ok(rooms
            .get(&room_id)
            .map(|messages| {
                messages
                    .iter()
                    .rev()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// 只在内存里累计经验值
#[derive(Default)]
pub struct MemoryRewardService {
    xp: RwLock<HashMap<UserId, u64>>,
}

impl MemoryRewardService {
    pub async fn xp(&self, user_id: UserId) -> u64 {
        self.xp.read().await.get(&user_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RewardService for MemoryRewardService {
    async fn grant(
        &self,
        user_id: UserId,
        amount: u32,
        reason: RewardReason,
    ) -> RepositoryResult<()> {
        let mut xp = self.xp.write().await;
        let total = xp.entry(user_id).or_insert(0);
        *total += u64::from(amount);
        debug!(user_id = %user_id, amount, reason = %reason, total = *total, "发放经验");
        Ok(())
    }
}
