//! 房间协调器
//!
//! 负责加入、离开、断线清理、重连宽限与房间管理操作。
//! 每个房间的成员变更由一把异步互斥锁串行化，锁只覆盖容量检查、成员写入和人数计算；
//! 事件在释放锁之后由同一任务按顺序发出。

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use config::RelayConfig;
use domain::{
    BanEntry, BanRepository, ChatMessage, LastMessage, RewardReason, RewardService, Room,
    RoomDirectory, RoomId, SessionId, UserId, UserStatus, Username,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    broadcaster::{
        Channel, MessageBroadcast, MessageBroadcaster, NoticeLevel, RosterEntry, ServerEvent,
        SystemNotice,
    },
    clock::Clock,
    error::ApplicationError,
    presence::{AddOutcome, PresenceStore},
    retry::{retry_async, RetryConfig},
    session::{GraceKey, SessionInfo, SessionRegistry},
};

#[derive(Debug, Clone)]
pub struct JoinRoomRequest {
    pub session_id: SessionId,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    /// 客户端重连时携带的上一个会话
    pub resume_from: Option<SessionId>,
}

#[derive(Debug, Clone)]
pub struct ModerationRequest {
    pub room_id: Uuid,
    pub target_user_id: Uuid,
    pub target_username: String,
    pub admin_id: Uuid, // 操作者（从会话身份获取）
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined { population: u64 },
    /// 用户已通过其他会话在房间内，本次只转移会话归属
    AlreadyPresent { population: u64 },
    /// 宽限期内重连，不重复欢迎、不重复计数
    Resumed { population: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left { population: u64 },
    NotPresent,
}

#[derive(Debug, Clone, Copy)]
enum Departure<'a> {
    Left,
    Kicked { user_id: UserId },
    Banned {
        user_id: UserId,
        reason: Option<&'a str>,
    },
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub join_reward: u32,
    pub reconnect_grace: Duration,
}

impl From<&RelayConfig> for CoordinatorSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            join_reward: config.join_reward,
            reconnect_grace: config.reconnect_grace(),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

pub struct RoomCoordinatorDependencies {
    pub presence: Arc<dyn PresenceStore>,
    pub directory: Arc<dyn RoomDirectory>,
    pub bans: Arc<dyn BanRepository>,
    pub rewards: Arc<dyn RewardService>,
    pub broadcaster: Arc<dyn MessageBroadcaster>,
    pub sessions: Arc<SessionRegistry>,
    pub clock: Arc<dyn Clock>,
    pub settings: CoordinatorSettings,
}

type LockMap = Arc<StdMutex<HashMap<RoomId, Arc<Mutex<()>>>>>;

/// 每个房间一把锁，最后一个持有者释放时移除
#[derive(Default)]
struct RoomLocks {
    locks: LockMap,
}

impl RoomLocks {
    async fn acquire(&self, room_id: RoomId) -> RoomGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(room_id).or_default())
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        RoomGuard {
            guard: Some(guard),
            room_id,
            lock,
            locks: Arc::clone(&self.locks),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

struct RoomGuard {
    guard: Option<OwnedMutexGuard<()>>,
    room_id: RoomId,
    lock: Arc<Mutex<()>>,
    locks: LockMap,
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // 只剩映射表和本守卫两份引用：没有其他任务在等待这把锁
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.room_id);
        }
    }
}

pub struct RoomCoordinator {
    deps: RoomCoordinatorDependencies,
    room_locks: RoomLocks,
    retry: RetryConfig,
}

impl RoomCoordinator {
    pub fn new(deps: RoomCoordinatorDependencies) -> Self {
        Self {
            deps,
            room_locks: RoomLocks::default(),
            retry: RetryConfig::store_default(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.deps.sessions
    }

    /// 建立会话：绑定身份、订阅个人通道、标记在线
    pub async fn connect(
        &self,
        session_id: SessionId,
        user_id: UserId,
        username: Username,
    ) -> Result<(), ApplicationError> {
        self.deps
            .sessions
            .register(session_id, user_id, username.clone())
            .await;
        self.subscribe(session_id, Channel::User(username.clone()))
            .await;
        retry_async(&self.retry, || {
            self.deps.presence.set_status(&username, UserStatus::Online)
        })
        .await?;

        self.emit(MessageBroadcast::to_session(
            session_id,
            ServerEvent::SessionReady {
                session_id,
                user_id,
                username: username.clone(),
            },
        ))
        .await;

        info!(session_id = %session_id, user_id = %user_id, username = %username, "会话已建立");
        Ok(())
    }

    /// 校验会话身份与请求中声明的身份一致
    pub async fn authorize(
        &self,
        session_id: SessionId,
        user_id: Option<UserId>,
        username: Option<&Username>,
    ) -> Result<SessionInfo, ApplicationError> {
        self.deps
            .sessions
            .authorize(session_id, user_id, username)
            .await
    }

    pub async fn join(&self, request: JoinRoomRequest) -> Result<JoinOutcome, ApplicationError> {
        let username = Username::parse(request.username)?;
        let room_id = RoomId::from(request.room_id);
        let user_id = UserId::from(request.user_id);
        let session = self
            .authorize(request.session_id, Some(user_id), Some(&username))
            .await?;
        self.renew_status(&session).await;

        if let Some(previous) = request.resume_from {
            let key = GraceKey {
                session_id: previous,
                room_id,
                username: username.clone(),
            };
            if self.deps.sessions.cancel_grace(&key).await {
                if let Some(outcome) = self
                    .resume(session.session_id, previous, room_id, &username)
                    .await?
                {
                    return Ok(outcome);
                }
            }
        }

        if self.deps.bans.is_banned(room_id, user_id, &username).await? {
            info!(room_id = %room_id, username = %username, "被封禁用户尝试加入房间");
            return Err(ApplicationError::forbidden("You are banned from this room"));
        }

        let room = self.find_room(room_id).await?;
        let now = self.deps.clock.now();

        let (outcome, superseded) = {
            let _guard = self.room_locks.acquire(room_id).await;
            let outcome = retry_async(&self.retry, || {
                self.deps
                    .presence
                    .add_member(room_id, &username, room.max_users, now)
            })
            .await?;
            let superseded = match outcome {
                AddOutcome::Full { .. } => None,
                _ => {
                    self.deps
                        .sessions
                        .bind_room(session.session_id, room_id, &username)
                        .await
                }
            };
            (outcome, superseded)
        };

        if let Some(old) = superseded {
            debug!(room_id = %room_id, old_session = %old, "新会话接管房间");
            self.unsubscribe(old, &Channel::Room(room_id)).await;
        }

        match outcome {
            AddOutcome::Full { population } => {
                info!(room_id = %room_id, username = %username, population, "房间已满");
                Err(ApplicationError::RoomFull)
            }
            AddOutcome::AlreadyPresent { population } => {
                self.subscribe(session.session_id, Channel::Room(room_id))
                    .await;
                self.send_join_ack(&session, &room, true).await?;
                Ok(JoinOutcome::AlreadyPresent { population })
            }
            AddOutcome::Added { population } => {
                self.subscribe(session.session_id, Channel::Room(room_id))
                    .await;
                self.announce_arrival(&session, &room, population).await?;
                self.grant_reward(user_id, self.deps.settings.join_reward, RewardReason::JoinRoom)
                    .await;

                info!(room_id = %room_id, username = %username, population, "用户加入房间");
                Ok(JoinOutcome::Joined { population })
            }
        }
    }

    /// 宽限期内重连：把归属转移到新会话。用户已不在房间时返回 None，按普通加入处理
    async fn resume(
        &self,
        session_id: SessionId,
        previous: SessionId,
        room_id: RoomId,
        username: &Username,
    ) -> Result<Option<JoinOutcome>, ApplicationError> {
        let population = {
            let _guard = self.room_locks.acquire(room_id).await;
            let still_present = retry_async(&self.retry, || {
                self.deps.presence.is_member(room_id, username)
            })
            .await?;
            if !still_present || self.deps.sessions.holder(room_id, username).await != Some(previous)
            {
                return Ok(None);
            }
            self.deps
                .sessions
                .bind_room(session_id, room_id, username)
                .await;
            retry_async(&self.retry, || self.deps.presence.population(room_id)).await?
        };

        self.unsubscribe(previous, &Channel::Room(room_id)).await;
        self.subscribe(session_id, Channel::Room(room_id)).await;

        let session = self.authorize(session_id, None, None).await?;
        let room = self.find_room(room_id).await?;
        self.send_join_ack(&session, &room, true).await?;

        info!(room_id = %room_id, username = %username, "宽限期内重连，恢复房间");
        Ok(Some(JoinOutcome::Resumed { population }))
    }

    /// 显式离开，第二次调用为空操作
    pub async fn leave(
        &self,
        room_id: RoomId,
        username: &Username,
    ) -> Result<LeaveOutcome, ApplicationError> {
        let (removed, holder) = {
            let _guard = self.room_locks.acquire(room_id).await;
            let removed = retry_async(&self.retry, || {
                self.deps.presence.remove_member(room_id, username)
            })
            .await?;
            let holder = self.deps.sessions.release_room(room_id, username).await;
            (removed, holder)
        };

        if let Some(session_id) = holder {
            self.unsubscribe(session_id, &Channel::Room(room_id)).await;
        }
        if !removed.removed {
            return Ok(LeaveOutcome::NotPresent);
        }

        self.announce_departure(room_id, username, removed.population, Departure::Left)
            .await?;
        info!(room_id = %room_id, username = %username, population = removed.population, "用户离开房间");
        Ok(LeaveOutcome::Left {
            population: removed.population,
        })
    }

    /// 传输断开：立即清理会话占有的所有房间
    pub async fn on_disconnect(&self, session_id: SessionId) {
        self.deps.sessions.cancel_session_timers(session_id).await;
        let Some(session) = self.deps.sessions.remove(session_id).await else {
            return;
        };

        // BTreeSet 保证按房间 ID 顺序清理
        for room_id in &session.rooms {
            if let Err(err) = self
                .release_session_room(session_id, *room_id, &session.username)
                .await
            {
                warn!(
                    session_id = %session_id,
                    room_id = %room_id,
                    error = %err,
                    "断线清理房间失败"
                );
            }
        }

        if !self
            .deps
            .sessions
            .has_active_session(&session.username)
            .await
        {
            if let Err(err) = self.deps.presence.clear_status(&session.username).await {
                warn!(username = %session.username, error = %err, "清除用户状态失败");
            }
        }

        info!(session_id = %session_id, username = %session.username, "会话已断开");
    }

    /// 挂起会话：为每个房间启动重连宽限计时器，之后的传输关闭不再立即清理
    pub async fn suspend(self: &Arc<Self>, session_id: SessionId) -> Result<(), ApplicationError> {
        let session = self
            .deps
            .sessions
            .mark_suspended(session_id)
            .await
            .ok_or_else(|| ApplicationError::not_found("session"))?;
        let grace = self.deps.settings.reconnect_grace;

        for room_id in &session.rooms {
            let key = GraceKey {
                session_id,
                room_id: *room_id,
                username: session.username.clone(),
            };
            self.deps.sessions.arm_grace(key.clone()).await;

            let coordinator = Arc::clone(self);
            let timer_key = key.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                coordinator.expire_grace(timer_key).await;
            });
            self.deps
                .sessions
                .attach_timer(&key, handle.abort_handle())
                .await;
        }

        info!(
            session_id = %session_id,
            rooms = session.rooms.len(),
            grace_ms = grace.as_millis() as u64,
            "会话已挂起"
        );
        Ok(())
    }

    /// 挂起会话的传输已关闭，只释放广播资源，房间由计时器处理
    pub async fn detach(&self, session_id: SessionId) {
        if self.deps.sessions.is_suspended(session_id).await {
            self.deps.sessions.remove_if_idle(session_id).await;
        } else {
            self.on_disconnect(session_id).await;
        }
    }

    async fn expire_grace(&self, key: GraceKey) {
        if !self.deps.sessions.take_grace(&key).await {
            return;
        }
        debug!(session_id = %key.session_id, room_id = %key.room_id, "重连宽限期到期");
        if let Err(err) = self
            .release_session_room(key.session_id, key.room_id, &key.username)
            .await
        {
            warn!(
                session_id = %key.session_id,
                room_id = %key.room_id,
                error = %err,
                "宽限期到期清理失败"
            );
        }
    }

    /// 仅当房间仍归属于该会话时移除在线条目并广播离开
    async fn release_session_room(
        &self,
        session_id: SessionId,
        room_id: RoomId,
        username: &Username,
    ) -> Result<(), ApplicationError> {
        let removed = {
            let _guard = self.room_locks.acquire(room_id).await;
            if !self
                .deps
                .sessions
                .release_room_if_held(session_id, room_id, username)
                .await
            {
                debug!(session_id = %session_id, room_id = %room_id, "房间已被其他会话接管，跳过清理");
                return Ok(());
            }
            retry_async(&self.retry, || {
                self.deps.presence.remove_member(room_id, username)
            })
            .await?
        };

        self.unsubscribe(session_id, &Channel::Room(room_id)).await;
        if removed.removed {
            self.announce_departure(room_id, username, removed.population, Departure::Left)
                .await?;
        }
        Ok(())
    }

    pub async fn kick(&self, request: ModerationRequest) -> Result<bool, ApplicationError> {
        let (room_id, target_id, target, admin_id) = Self::moderation_parts(&request)?;
        self.check_admin(room_id, admin_id).await?;

        let removed = self
            .force_remove(room_id, &target, Departure::Kicked { user_id: target_id })
            .await?;
        info!(room_id = %room_id, target = %target, admin_id = %admin_id, removed, "踢出用户");
        Ok(removed)
    }

    pub async fn ban(&self, request: ModerationRequest) -> Result<bool, ApplicationError> {
        let (room_id, target_id, target, admin_id) = Self::moderation_parts(&request)?;
        self.check_admin(room_id, admin_id).await?;

        self.deps
            .bans
            .ban(BanEntry {
                room_id,
                user_id: target_id,
                username: target.clone(),
                banned_by: admin_id,
                reason: request.reason.clone(),
                banned_at: self.deps.clock.now(),
            })
            .await?;

        let removed = self
            .force_remove(
                room_id,
                &target,
                Departure::Banned {
                    user_id: target_id,
                    reason: request.reason.as_deref(),
                },
            )
            .await?;
        info!(room_id = %room_id, target = %target, admin_id = %admin_id, removed, "封禁用户");
        Ok(removed)
    }

    /// 解除封禁，确认只回给调用方
    pub async fn unban(&self, request: ModerationRequest) -> Result<ServerEvent, ApplicationError> {
        let (room_id, target_id, target, admin_id) = Self::moderation_parts(&request)?;
        self.check_admin(room_id, admin_id).await?;

        let existed = self.deps.bans.unban(room_id, target_id, &target).await?;
        if !existed {
            return Err(ApplicationError::not_found("ban"));
        }
        info!(room_id = %room_id, target = %target, admin_id = %admin_id, "解除封禁");
        Ok(ServerEvent::UserUnbanned {
            room_id,
            user_id: target_id,
            username: target,
        })
    }

    pub async fn room_users(&self, room_id: RoomId) -> Result<ServerEvent, ApplicationError> {
        let users = self.roster(room_id).await?;
        Ok(ServerEvent::RoomUsers {
            room_id,
            count: users.len() as u64,
            users,
        })
    }

    pub async fn room_info(&self, room_id: RoomId) -> Result<ServerEvent, ApplicationError> {
        let room = self.find_room(room_id).await?;
        let users = self.roster(room_id).await?;
        let recent_notices =
            retry_async(&self.retry, || self.deps.presence.recent_notices(room_id)).await?;
        Ok(ServerEvent::RoomInfo {
            room,
            user_count: users.len() as u64,
            users,
            recent_notices,
        })
    }

    /// 会话有活动（心跳等）时按所选状态重新写入，过期后同样恢复
    pub async fn touch(&self, session_id: SessionId) {
        if let Some(session) = self.deps.sessions.get(session_id).await {
            self.renew_status(&session).await;
        }
    }

    /// 记录用户选择的状态，不广播
    pub async fn update_status(
        &self,
        username: &Username,
        status: UserStatus,
    ) -> Result<(), ApplicationError> {
        retry_async(&self.retry, || self.deps.presence.set_status(username, status)).await?;
        self.deps.sessions.set_user_status(username, status).await;
        Ok(())
    }

    /// 更新状态并通知用户所在房间
    pub async fn set_status(
        &self,
        session_id: SessionId,
        status: UserStatus,
    ) -> Result<ServerEvent, ApplicationError> {
        let session = self.authorize(session_id, None, None).await?;
        self.update_status(&session.username, status).await?;

        let event = ServerEvent::Status {
            username: session.username.clone(),
            status: status.visible(),
        };
        let rooms = retry_async(&self.retry, || {
            self.deps.presence.user_rooms(&session.username)
        })
        .await?;
        for room_id in rooms {
            self.emit(MessageBroadcast::to_room(room_id, event.clone()))
                .await;
        }
        Ok(ServerEvent::Status {
            username: session.username,
            status,
        })
    }

    pub async fn subscribe_room_list(&self, session_id: SessionId) {
        self.subscribe(session_id, Channel::RoomList).await;
    }

    pub async fn unsubscribe_room_list(&self, session_id: SessionId) {
        self.unsubscribe(session_id, &Channel::RoomList).await;
    }

    pub async fn room(&self, room_id: RoomId) -> Result<Room, ApplicationError> {
        self.find_room(room_id).await
    }

    /// 带状态的在线列表，按加入顺序
    pub async fn roster(&self, room_id: RoomId) -> Result<Vec<RosterEntry>, ApplicationError> {
        let members = retry_async(&self.retry, || self.deps.presence.members(room_id)).await?;
        let names: Vec<Username> = members.into_iter().map(|entry| entry.username).collect();
        let statuses = retry_async(&self.retry, || self.deps.presence.statuses(&names)).await?;

        Ok(names
            .into_iter()
            .zip(statuses)
            .map(|(username, status)| RosterEntry {
                username,
                status: status.visible(),
            })
            .collect())
    }

    fn moderation_parts(
        request: &ModerationRequest,
    ) -> Result<(RoomId, UserId, Username, UserId), ApplicationError> {
        Ok((
            RoomId::from(request.room_id),
            UserId::from(request.target_user_id),
            Username::parse(request.target_username.clone())?,
            UserId::from(request.admin_id),
        ))
    }

    async fn check_admin(&self, room_id: RoomId, admin_id: UserId) -> Result<(), ApplicationError> {
        if self.deps.directory.is_room_admin(room_id, admin_id).await? {
            Ok(())
        } else {
            Err(ApplicationError::forbidden(
                "You do not have admin rights in this room",
            ))
        }
    }

    async fn find_room(&self, room_id: RoomId) -> Result<Room, ApplicationError> {
        self.deps
            .directory
            .find_by_id(room_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("room"))
    }

    async fn force_remove(
        &self,
        room_id: RoomId,
        target: &Username,
        departure: Departure<'_>,
    ) -> Result<bool, ApplicationError> {
        let (removed, holder) = {
            let _guard = self.room_locks.acquire(room_id).await;
            let removed = retry_async(&self.retry, || {
                self.deps.presence.remove_member(room_id, target)
            })
            .await?;
            let holder = self.deps.sessions.release_room(room_id, target).await;
            (removed, holder)
        };

        if let Some(session_id) = holder {
            self.unsubscribe(session_id, &Channel::Room(room_id)).await;
        }
        self.announce_departure(room_id, target, removed.population, departure)
            .await?;
        Ok(removed.removed)
    }

    async fn announce_arrival(
        &self,
        session: &SessionInfo,
        room: &Room,
        population: u64,
    ) -> Result<(), ApplicationError> {
        let room_id = room.id;
        let username = &session.username;
        let users = self.roster(room_id).await?;
        let now = self.deps.clock.now();

        let occupants = if users.is_empty() {
            username.to_string()
        } else {
            users
                .iter()
                .map(|entry| entry.username.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let welcome = [
            format!("Welcome to {}...", room.name),
            format!("Currently users in the room: {occupants}"),
            format!("This room is managed by {}", room.manager_name()),
        ];

        // (a) 欢迎语只发给加入的会话
        for text in &welcome {
            self.emit(MessageBroadcast::to_session(
                session.session_id,
                ServerEvent::ChatMessage(ChatMessage::system(room_id, &room.name, text, now)),
            ))
            .await;
        }

        // (b) 进入提示
        let entered = format!("{username} [{population}] has entered");
        self.emit(MessageBroadcast::to_room(
            room_id,
            ServerEvent::ChatMessage(ChatMessage::system(room_id, &room.name, &entered, now)),
        ))
        .await;

        // (c) 在线列表
        self.emit(MessageBroadcast::to_room(
            room_id,
            ServerEvent::UserJoined {
                room_id,
                username: username.clone(),
                users,
            },
        ))
        .await;

        // (d) 个人通道确认
        self.send_join_ack(session, room, false).await?;
        self.emit(MessageBroadcast::to_user(
            username.clone(),
            ServerEvent::ChatListUpdate { room_id },
        ))
        .await;

        // (e) 房间列表人数
        self.emit(MessageBroadcast::to_room_list(ServerEvent::RoomCount {
            room_id,
            user_count: population,
            max_users: room.max_users,
        }))
        .await;

        for text in welcome.iter().chain(std::iter::once(&entered)) {
            self.record_notice(room_id, &format!("{} : {}", room.name, text))
                .await;
        }
        self.record_last_message(
            room_id,
            LastMessage {
                message: format!("{username} joined"),
                username: username.to_string(),
                timestamp: now,
            },
        )
        .await;
        Ok(())
    }

    async fn send_join_ack(
        &self,
        session: &SessionInfo,
        room: &Room,
        resumed: bool,
    ) -> Result<(), ApplicationError> {
        let users = self.roster(room.id).await?;
        let event = ServerEvent::RoomJoined {
            room_id: room.id,
            room: room.clone(),
            user_count: users.len() as u64,
            users,
            resumed,
        };
        let payload = if resumed {
            MessageBroadcast::to_session(session.session_id, event)
        } else {
            MessageBroadcast::to_user(session.username.clone(), event)
        };
        self.emit(payload).await;
        Ok(())
    }

    async fn announce_departure(
        &self,
        room_id: RoomId,
        username: &Username,
        population: u64,
        departure: Departure<'_>,
    ) -> Result<(), ApplicationError> {
        // 房间元数据缺失不影响离开流程
        let room = match self.deps.directory.find_by_id(room_id).await {
            Ok(room) => room,
            Err(err) => {
                warn!(room_id = %room_id, error = %err, "读取房间信息失败");
                None
            }
        };
        let room_name = room
            .as_ref()
            .map_or_else(|| room_id.to_string(), |r| r.name.clone());
        let now = self.deps.clock.now();
        let users = self.roster(room_id).await?;

        match departure {
            Departure::Left => {
                let text = format!("{username} [{population}] has left");
                self.emit(MessageBroadcast::to_room(
                    room_id,
                    ServerEvent::ChatMessage(ChatMessage::system(room_id, &room_name, &text, now)),
                ))
                .await;
                self.emit(MessageBroadcast::to_room(
                    room_id,
                    ServerEvent::UserLeft {
                        room_id,
                        username: username.clone(),
                        users,
                    },
                ))
                .await;
                self.emit(MessageBroadcast::to_user(
                    username.clone(),
                    ServerEvent::RoomLeft { room_id },
                ))
                .await;
                self.record_notice(room_id, &format!("{room_name} : {text}"))
                    .await;
            }
            Departure::Kicked { user_id } | Departure::Banned { user_id, .. } => {
                let (text, event) = match departure {
                    Departure::Banned { reason, .. } => (
                        match reason {
                            Some(reason) => {
                                format!("{username} has been banned from the room: {reason}")
                            }
                            None => format!("{username} has been banned from the room"),
                        },
                        ServerEvent::UserBanned {
                            room_id,
                            user_id,
                            username: username.clone(),
                            reason: reason.map(str::to_string),
                        },
                    ),
                    _ => (
                        format!("{username} has been kicked from the room"),
                        ServerEvent::UserKicked {
                            room_id,
                            user_id,
                            username: username.clone(),
                        },
                    ),
                };

                self.emit(MessageBroadcast::to_room(
                    room_id,
                    ServerEvent::SystemMessage(SystemNotice {
                        room_id: Some(room_id),
                        message: text.clone(),
                        level: NoticeLevel::Error,
                        timestamp: now,
                    }),
                ))
                .await;
                self.emit(MessageBroadcast::to_room(room_id, event.clone()))
                    .await;
                self.emit(MessageBroadcast::to_room(
                    room_id,
                    ServerEvent::RoomUsers {
                        room_id,
                        count: users.len() as u64,
                        users,
                    },
                ))
                .await;
                // 被处理的用户已退订房间，单独通知其个人通道
                self.emit(MessageBroadcast::to_user(username.clone(), event))
                    .await;
                self.record_notice(room_id, &format!("{room_name} : {text}"))
                    .await;
            }
        }

        self.emit(MessageBroadcast::to_user(
            username.clone(),
            ServerEvent::ChatListUpdate { room_id },
        ))
        .await;
        if let Some(room) = room {
            self.emit(MessageBroadcast::to_room_list(ServerEvent::RoomCount {
                room_id,
                user_count: population,
                max_users: room.max_users,
            }))
            .await;
        }
        Ok(())
    }

    async fn grant_reward(&self, user_id: UserId, amount: u32, reason: RewardReason) {
        if amount == 0 {
            return;
        }
        if let Err(err) = self.deps.rewards.grant(user_id, amount, reason).await {
            warn!(user_id = %user_id, reason = %reason, error = %err, "发放经验失败");
        }
    }

    async fn renew_status(&self, session: &SessionInfo) {
        if let Err(err) = self
            .deps
            .presence
            .set_status(&session.username, session.status)
            .await
        {
            warn!(username = %session.username, error = %err, "续期用户状态失败");
        }
    }

    async fn record_notice(&self, room_id: RoomId, notice: &str) {
        if let Err(err) = self.deps.presence.push_notice(room_id, notice).await {
            warn!(room_id = %room_id, error = %err, "记录系统通知失败");
        }
    }

    async fn record_last_message(&self, room_id: RoomId, last: LastMessage) {
        if let Err(err) = self.deps.presence.set_last_message(room_id, &last).await {
            warn!(room_id = %room_id, error = %err, "更新最后消息失败");
        }
    }

    async fn subscribe(&self, session_id: SessionId, channel: Channel) {
        if let Err(err) = self.deps.broadcaster.subscribe(session_id, channel).await {
            warn!(session_id = %session_id, error = %err, "订阅通道失败");
        }
    }

    async fn unsubscribe(&self, session_id: SessionId, channel: &Channel) {
        if let Err(err) = self.deps.broadcaster.unsubscribe(session_id, channel).await {
            warn!(session_id = %session_id, error = %err, "退订通道失败");
        }
    }

    async fn emit(&self, payload: MessageBroadcast) {
        let event = payload.event.name();
        if let Err(err) = self.deps.broadcaster.broadcast(payload).await {
            warn!(event, error = %err, "事件投递失败");
        }
    }
}
