//! 集成测试公共设施：内存协作者与测试客户端

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use application::presence::memory::MemoryPresenceStore;
use application::rate_limiter::memory::MemoryRateLimiter;
use application::{
    ApplicationError, CoordinatorSettings, JoinOutcome, JoinRoomRequest, LocalMessageBroadcaster,
    MessageRelay, MessageRelayDependencies, RelaySettings, RoomCoordinator,
    RoomCoordinatorDependencies, SendMessageRequest, SendOutcome, ServerEvent, SessionRegistry,
    SystemClock,
};
use async_trait::async_trait;
use config::{PresenceConfig, RateLimitConfig};
use domain::{
    BanEntry, BanRepository, ChatMessage, MessageId, MessageRepository, RepositoryError,
    RepositoryResult, RewardReason, RewardService, Room, RoomDirectory, RoomId, SessionId, UserId,
    Username,
};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Default)]
pub struct FakeDirectory {
    rooms: Mutex<HashMap<RoomId, Room>>,
    admins: Mutex<HashSet<(RoomId, UserId)>>,
}

impl FakeDirectory {
    pub fn insert(&self, room: Room) {
        self.rooms.lock().unwrap().insert(room.id, room);
    }

    pub fn grant_admin(&self, room_id: RoomId, user_id: UserId) {
        self.admins.lock().unwrap().insert((room_id, user_id));
    }
}

#[async_trait]
impl RoomDirectory for FakeDirectory {
    async fn find_by_id(&self, room_id: RoomId) -> RepositoryResult<Option<Room>> {
        Ok(self.rooms.lock().unwrap().get(&room_id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> RepositoryResult<Option<Room>> {
        Ok(self
            .rooms
            .lock()
            .unwrap()
            .values()
            .find(|room| room.name == name)
            .cloned())
    }

    async fn is_room_admin(&self, room_id: RoomId, user_id: UserId) -> RepositoryResult<bool> {
        let owner = self
            .rooms
            .lock()
            .unwrap()
            .get(&room_id)
            .is_some_and(|room| room.owner_id == user_id);
        Ok(owner || self.admins.lock().unwrap().contains(&(room_id, user_id)))
    }
}

#[derive(Default)]
pub struct FakeBans {
    entries: Mutex<Vec<BanEntry>>,
}

#[async_trait]
impl BanRepository for FakeBans {
    async fn is_banned(
        &self,
        room_id: RoomId,
        user_id: UserId,
        username: &Username,
    ) -> RepositoryResult<bool> {
        Ok(self.entries.lock().unwrap().iter().any(|entry| {
            entry.room_id == room_id && (entry.user_id == user_id || &entry.username == username)
        }))
    }

    async fn ban(&self, entry: BanEntry) -> RepositoryResult<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }

    async fn unban(
        &self,
        room_id: RoomId,
        user_id: UserId,
        username: &Username,
    ) -> RepositoryResult<bool> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|entry| {
            !(entry.room_id == room_id
                && (entry.user_id == user_id || &entry.username == username))
        });
        Ok(entries.len() != before)
    }

    async fn list_bans(&self, room_id: RoomId) -> RepositoryResult<Vec<BanEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.room_id == room_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct FakeMessages {
    stored: Mutex<Vec<ChatMessage>>,
    fail_inserts: AtomicBool,
}

impl FakeMessages {
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn stored(&self) -> Vec<ChatMessage> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageRepository for FakeMessages {
    async fn insert(&self, message: &ChatMessage) -> RepositoryResult<ChatMessage> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(RepositoryError::storage("insert failed"));
        }
        self.stored.lock().unwrap().push(message.clone());
        Ok(message.clone())
    }

    async fn delete(&self, message_id: MessageId) -> RepositoryResult<bool> {
        let mut stored = self.stored.lock().unwrap();
        let before = stored.len();
        stored.retain(|message| message.id != message_id);
        Ok(stored.len() != before)
    }

    async fn list(
        &self,
        room_id: RoomId,
        limit: u32,
        offset: u32,
    ) -> RepositoryResult<Vec<ChatMessage>> {
        let stored = self.stored.lock().unwrap();
        Ok(stored
            .iter()
            .rev()
            .filter(|message| message.room_id == room_id)
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct CountingRewards {
    grants: Mutex<Vec<(UserId, u32, RewardReason)>>,
}

impl CountingRewards {
    pub fn count(&self, user_id: UserId, reason: RewardReason) -> usize {
        self.grants
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, r)| *id == user_id && *r == reason)
            .count()
    }
}

#[async_trait]
impl RewardService for CountingRewards {
    async fn grant(&self, user_id: UserId, amount: u32, reason: RewardReason) -> RepositoryResult<()> {
        self.grants.lock().unwrap().push((user_id, amount, reason));
        Ok(())
    }
}

pub struct TestClient {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub username: Username,
    pub rx: mpsc::Receiver<ServerEvent>,
}

impl TestClient {
    /// 取出当前已投递的全部事件
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// 事件中的聊天/系统消息文本
pub fn chat_texts(events: &[ServerEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::ChatMessage(message) => Some(message.message.clone()),
            _ => None,
        })
        .collect()
}

pub fn notice_texts(events: &[ServerEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::SystemMessage(notice) => Some(notice.message.clone()),
            _ => None,
        })
        .collect()
}

pub fn event_names(events: &[ServerEvent]) -> Vec<&'static str> {
    events.iter().map(ServerEvent::name).collect()
}

pub struct Harness {
    pub coordinator: Arc<RoomCoordinator>,
    pub relay: Arc<MessageRelay>,
    pub hub: Arc<LocalMessageBroadcaster>,
    pub presence: Arc<MemoryPresenceStore>,
    pub directory: Arc<FakeDirectory>,
    pub bans: Arc<FakeBans>,
    pub messages: Arc<FakeMessages>,
    pub rewards: Arc<CountingRewards>,
    pub sessions: Arc<SessionRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(CoordinatorSettings::default(), RateLimitConfig::default())
    }

    pub fn with_settings(settings: CoordinatorSettings, rate_limit: RateLimitConfig) -> Self {
        let presence = Arc::new(MemoryPresenceStore::new(PresenceConfig::default()));
        let directory = Arc::new(FakeDirectory::default());
        let bans = Arc::new(FakeBans::default());
        let messages = Arc::new(FakeMessages::default());
        let rewards = Arc::new(CountingRewards::default());
        let hub = Arc::new(LocalMessageBroadcaster::new(256));
        let sessions = Arc::new(SessionRegistry::new());
        let clock = Arc::new(SystemClock);

        let coordinator = Arc::new(RoomCoordinator::new(RoomCoordinatorDependencies {
            presence: presence.clone(),
            directory: directory.clone(),
            bans: bans.clone(),
            rewards: rewards.clone(),
            broadcaster: hub.clone(),
            sessions: sessions.clone(),
            clock: clock.clone(),
            settings,
        }));
        let relay = Arc::new(MessageRelay::new(MessageRelayDependencies {
            presence: presence.clone(),
            rate_limiter: Arc::new(MemoryRateLimiter::new(rate_limit)),
            messages: messages.clone(),
            directory: directory.clone(),
            rewards: rewards.clone(),
            broadcaster: hub.clone(),
            sessions: sessions.clone(),
            clock,
            settings: RelaySettings::default(),
        }));

        Self {
            coordinator,
            relay,
            hub,
            presence,
            directory,
            bans,
            messages,
            rewards,
            sessions,
        }
    }

    pub fn add_room(&self, name: &str, max_users: u32, owner_id: UserId) -> Room {
        let room = Room {
            id: RoomId::from(Uuid::new_v4()),
            name: name.to_string(),
            description: None,
            max_users,
            is_private: false,
            owner_id,
            owner_name: None,
        };
        self.directory.insert(room.clone());
        room
    }

    pub async fn connect(&self, name: &str) -> TestClient {
        self.connect_as(name, UserId::from(Uuid::new_v4())).await
    }

    pub async fn connect_as(&self, name: &str, user_id: UserId) -> TestClient {
        let session_id = SessionId::generate();
        let username = Username::parse(name).unwrap();
        let rx = self.hub.register(session_id).await;
        self.coordinator
            .connect(session_id, user_id, username.clone())
            .await
            .unwrap();
        let mut client = TestClient {
            session_id,
            user_id,
            username,
            rx,
        };
        client.drain();
        client
    }

    /// 断开传输：注销广播并按会话状态清理
    pub async fn close(&self, client: &TestClient) {
        self.hub.unregister(client.session_id).await;
        self.coordinator.detach(client.session_id).await;
    }

    pub async fn join(
        &self,
        client: &TestClient,
        room: &Room,
    ) -> Result<JoinOutcome, ApplicationError> {
        self.join_resuming(client, room, None).await
    }

    pub async fn join_resuming(
        &self,
        client: &TestClient,
        room: &Room,
        resume_from: Option<SessionId>,
    ) -> Result<JoinOutcome, ApplicationError> {
        self.coordinator
            .join(JoinRoomRequest {
                session_id: client.session_id,
                room_id: room.id.into(),
                user_id: client.user_id.into(),
                username: client.username.to_string(),
                resume_from,
            })
            .await
    }

    pub async fn send(
        &self,
        client: &TestClient,
        room: &Room,
        text: &str,
    ) -> Result<SendOutcome, ApplicationError> {
        self.relay
            .send_message(SendMessageRequest {
                session_id: client.session_id,
                room_id: room.id.into(),
                user_id: client.user_id.into(),
                username: client.username.to_string(),
                message: text.to_string(),
            })
            .await
    }
}
