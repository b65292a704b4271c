//! 会话注册表
//!
//! 记录传输会话与认证身份的绑定、会话所在房间、(房间, 用户) 当前归属的会话，
//! 以及挂起会话的重连宽限计时器。计时器以 (会话, 房间, 用户) 为键，
//! 同一用户在其他会话中的活动不会误取消它。

use std::collections::{BTreeSet, HashMap};

use domain::{RoomId, SessionId, UserId, UserStatus, Username};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::error::ApplicationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub username: Username,
    pub rooms: BTreeSet<RoomId>,
    pub suspended: bool,
    /// 用户选择的状态，活动续期时按它重新写入
    pub status: UserStatus,
}

/// 重连宽限计时器的键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraceKey {
    pub session_id: SessionId,
    pub room_id: RoomId,
    pub username: Username,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, SessionInfo>,
    bindings: HashMap<(RoomId, Username), SessionId>,
    grace_timers: HashMap<GraceKey, Option<AbortHandle>>,
}

impl RegistryState {
    /// 会话已挂起且不再占有任何房间时移除
    fn forget_if_idle(&mut self, session_id: SessionId) {
        let idle = self
            .sessions
            .get(&session_id)
            .is_some_and(|info| info.suspended && info.rooms.is_empty());
        if idle {
            self.sessions.remove(&session_id);
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session_id: SessionId, user_id: UserId, username: Username) {
        let mut state = self.state.lock().await;
        state.sessions.insert(
            session_id,
            SessionInfo {
                session_id,
                user_id,
                username,
                rooms: BTreeSet::new(),
                suspended: false,
                status: UserStatus::Online,
            },
        );
    }

    pub async fn get(&self, session_id: SessionId) -> Option<SessionInfo> {
        self.state.lock().await.sessions.get(&session_id).cloned()
    }

    /// 校验请求中声明的身份与会话绑定的身份一致
    pub async fn authorize(
        &self,
        session_id: SessionId,
        user_id: Option<UserId>,
        username: Option<&Username>,
    ) -> Result<SessionInfo, ApplicationError> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| ApplicationError::forbidden("session is not authenticated"))?;

        if user_id.is_some_and(|id| id != session.user_id)
            || username.is_some_and(|name| name != &session.username)
        {
            return Err(ApplicationError::forbidden(
                "identity does not match the authenticated session",
            ));
        }
        Ok(session)
    }

    /// 更新该用户所有会话记录的状态
    pub async fn set_user_status(&self, username: &Username, status: UserStatus) {
        let mut state = self.state.lock().await;
        for info in state
            .sessions
            .values_mut()
            .filter(|info| &info.username == username)
        {
            info.status = status;
        }
    }

    /// 移除会话，返回其最后的状态；房间归属保留，由调用方逐个释放
    pub async fn remove(&self, session_id: SessionId) -> Option<SessionInfo> {
        self.state.lock().await.sessions.remove(&session_id)
    }

    /// 用户是否还有其他未挂起的会话
    pub async fn has_active_session(&self, username: &Username) -> bool {
        let state = self.state.lock().await;
        state
            .sessions
            .values()
            .any(|info| &info.username == username && !info.suspended)
    }

    /// 将 (房间, 用户) 归属到指定会话，返回被取代的旧会话
    pub async fn bind_room(
        &self,
        session_id: SessionId,
        room_id: RoomId,
        username: &Username,
    ) -> Option<SessionId> {
        let mut state = self.state.lock().await;
        let previous = state
            .bindings
            .insert((room_id, username.clone()), session_id)
            .filter(|prev| *prev != session_id);

        if let Some(prev) = previous {
            if let Some(info) = state.sessions.get_mut(&prev) {
                info.rooms.remove(&room_id);
            }
            state.forget_if_idle(prev);
        }
        if let Some(info) = state.sessions.get_mut(&session_id) {
            info.rooms.insert(room_id);
        }
        previous
    }

    /// 当前占有 (房间, 用户) 的会话
    pub async fn holder(&self, room_id: RoomId, username: &Username) -> Option<SessionId> {
        let state = self.state.lock().await;
        state.bindings.get(&(room_id, username.clone())).copied()
    }

    /// 无条件释放 (房间, 用户) 的归属，返回原占有会话
    pub async fn release_room(&self, room_id: RoomId, username: &Username) -> Option<SessionId> {
        let mut state = self.state.lock().await;
        let holder = state.bindings.remove(&(room_id, username.clone()))?;
        if let Some(info) = state.sessions.get_mut(&holder) {
            info.rooms.remove(&room_id);
        }
        state.forget_if_idle(holder);
        Some(holder)
    }

    /// 仅当归属仍属于该会话时释放，返回是否释放
    pub async fn release_room_if_held(
        &self,
        session_id: SessionId,
        room_id: RoomId,
        username: &Username,
    ) -> bool {
        let mut state = self.state.lock().await;
        let key = (room_id, username.clone());
        let held = match state.bindings.get(&key) {
            Some(holder) => *holder == session_id,
            // 没有归属记录时按会话自身的房间集合判断
            None => state
                .sessions
                .get(&session_id)
                .is_some_and(|info| info.rooms.contains(&room_id)),
        };
        if !held {
            return false;
        }
        state.bindings.remove(&key);
        if let Some(info) = state.sessions.get_mut(&session_id) {
            info.rooms.remove(&room_id);
        }
        state.forget_if_idle(session_id);
        true
    }

    pub async fn mark_suspended(&self, session_id: SessionId) -> Option<SessionInfo> {
        let mut state = self.state.lock().await;
        let info = state.sessions.get_mut(&session_id)?;
        info.suspended = true;
        Some(info.clone())
    }

    /// 挂起且已无房间的会话直接移除
    pub async fn remove_if_idle(&self, session_id: SessionId) {
        self.state.lock().await.forget_if_idle(session_id);
    }

    pub async fn is_suspended(&self, session_id: SessionId) -> bool {
        let state = self.state.lock().await;
        state
            .sessions
            .get(&session_id)
            .is_some_and(|info| info.suspended)
    }

    /// 登记一个待启动的宽限计时器
    pub async fn arm_grace(&self, key: GraceKey) {
        self.state.lock().await.grace_timers.insert(key, None);
    }

    /// 关联计时任务；若键已被取消则立即中止任务
    pub async fn attach_timer(&self, key: &GraceKey, handle: AbortHandle) {
        let mut state = self.state.lock().await;
        match state.grace_timers.get_mut(key) {
            Some(slot) => *slot = Some(handle),
            None => handle.abort(),
        }
    }

    /// 取消计时器，返回是否确实存在一个待触发的计时器
    pub async fn cancel_grace(&self, key: &GraceKey) -> bool {
        let mut state = self.state.lock().await;
        match state.grace_timers.remove(key) {
            Some(handle) => {
                if let Some(handle) = handle {
                    handle.abort();
                }
                true
            }
            None => false,
        }
    }

    /// 计时器触发时调用，返回计时器是否仍然有效
    pub async fn take_grace(&self, key: &GraceKey) -> bool {
        self.state.lock().await.grace_timers.remove(key).is_some()
    }

    /// 取消某会话的全部计时器
    pub async fn cancel_session_timers(&self, session_id: SessionId) -> usize {
        let mut state = self.state.lock().await;
        let keys: Vec<GraceKey> = state
            .grace_timers
            .keys()
            .filter(|key| key.session_id == session_id)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(Some(handle)) = state.grace_timers.remove(key) {
                handle.abort();
            }
        }
        keys.len()
    }

    pub async fn pending_grace_count(&self) -> usize {
        self.state.lock().await.grace_timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn alice() -> Username {
        Username::parse("alice").unwrap()
    }

    #[tokio::test]
    async fn binding_a_room_supersedes_previous_session() {
        let registry = SessionRegistry::new();
        let user_id = UserId::from(Uuid::new_v4());
        let room_id = RoomId::from(Uuid::new_v4());
        let (old, new) = (SessionId::generate(), SessionId::generate());
        registry.register(old, user_id, alice()).await;
        registry.register(new, user_id, alice()).await;

        assert_eq!(registry.bind_room(old, room_id, &alice()).await, None);
        assert_eq!(registry.bind_room(new, room_id, &alice()).await, Some(old));
        assert_eq!(registry.bind_room(new, room_id, &alice()).await, None);

        assert!(registry.get(old).await.unwrap().rooms.is_empty());
        assert!(!registry.release_room_if_held(old, room_id, &alice()).await);
        assert!(registry.release_room_if_held(new, room_id, &alice()).await);
        assert_eq!(registry.holder(room_id, &alice()).await, None);
    }

    #[tokio::test]
    async fn grace_timer_is_consumed_exactly_once() {
        let registry = SessionRegistry::new();
        let key = GraceKey {
            session_id: SessionId::generate(),
            room_id: RoomId::from(Uuid::new_v4()),
            username: alice(),
        };

        registry.arm_grace(key.clone()).await;
        assert!(registry.cancel_grace(&key).await);
        assert!(!registry.take_grace(&key).await);

        registry.arm_grace(key.clone()).await;
        assert!(registry.take_grace(&key).await);
        assert!(!registry.cancel_grace(&key).await);
    }

    #[tokio::test]
    async fn status_choice_applies_to_every_session_of_the_user() {
        let registry = SessionRegistry::new();
        let user_id = UserId::from(Uuid::new_v4());
        let (phone, laptop) = (SessionId::generate(), SessionId::generate());
        registry.register(phone, user_id, alice()).await;
        registry.register(laptop, user_id, alice()).await;
        assert_eq!(registry.get(phone).await.unwrap().status, UserStatus::Online);

        registry.set_user_status(&alice(), UserStatus::Away).await;
        assert_eq!(registry.get(phone).await.unwrap().status, UserStatus::Away);
        assert_eq!(registry.get(laptop).await.unwrap().status, UserStatus::Away);
    }

    #[tokio::test]
    async fn suspended_session_is_forgotten_after_last_room() {
        let registry = SessionRegistry::new();
        let session = SessionId::generate();
        let room_id = RoomId::from(Uuid::new_v4());
        registry
            .register(session, UserId::from(Uuid::new_v4()), alice())
            .await;
        registry.bind_room(session, room_id, &alice()).await;
        registry.mark_suspended(session).await;
        assert!(!registry.has_active_session(&alice()).await);

        assert!(registry.release_room_if_held(session, room_id, &alice()).await);
        assert!(registry.get(session).await.is_none());
    }
}
