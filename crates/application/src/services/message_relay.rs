//! 消息中继
//!
//! 校验、限流、持久化、房间广播、会话列表通知与经验奖励。

use std::sync::Arc;

use config::RelayConfig;
use domain::{
    ChatMessage, LastMessage, MessageId, MessagePage, MessageRepository, RewardReason,
    RewardService, RoomDirectory, RoomId, SessionId, UserId, Username,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    broadcaster::{
        ChatListEntry, MessageBroadcast, MessageBroadcaster, NoticeLevel, ServerEvent,
        SystemNotice,
    },
    clock::Clock,
    error::ApplicationError,
    presence::PresenceStore,
    rate_limiter::{RateDecision, RateLimitError, RateLimiter},
    retry::{retry_async, RetryConfig},
    session::SessionRegistry,
};

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub session_id: SessionId,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct DeleteMessageRequest {
    pub session_id: SessionId,
    pub room_id: Uuid,
    pub message_id: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct GetMessagesRequest {
    pub room_id: Uuid,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Delivered(ChatMessage),
    /// 被限流时不算错误，警告已发给发送者
    RateLimited(RateLimitError),
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub max_message_length: usize,
    pub message_reward: u32,
    pub history_default_limit: u32,
    pub history_max_limit: u32,
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_message_length: config.max_message_length,
            message_reward: config.message_reward,
            history_default_limit: config.history_default_limit,
            history_max_limit: config.history_max_limit,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

pub struct MessageRelayDependencies {
    pub presence: Arc<dyn PresenceStore>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub messages: Arc<dyn MessageRepository>,
    pub directory: Arc<dyn RoomDirectory>,
    pub rewards: Arc<dyn RewardService>,
    pub broadcaster: Arc<dyn MessageBroadcaster>,
    pub sessions: Arc<SessionRegistry>,
    pub clock: Arc<dyn Clock>,
    pub settings: RelaySettings,
}

pub struct MessageRelay {
    deps: MessageRelayDependencies,
    retry: RetryConfig,
}

impl MessageRelay {
    pub fn new(deps: MessageRelayDependencies) -> Self {
        Self {
            deps,
            retry: RetryConfig::store_default(),
        }
    }

    pub async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<SendOutcome, ApplicationError> {
        let room_id = RoomId::from(request.room_id);
        let user_id = UserId::from(request.user_id);
        let username = Username::parse(request.username)?;

        if request.message.trim().is_empty() {
            return Err(ApplicationError::validation("message cannot be empty"));
        }
        let max = self.deps.settings.max_message_length;
        if request.message.chars().count() > max {
            return Err(ApplicationError::validation(format!(
                "Message too long (max {max} characters)"
            )));
        }

        let session = self
            .deps
            .sessions
            .authorize(request.session_id, Some(user_id), Some(&username))
            .await?;
        // 任何发送尝试都算活动，状态过期后也会重新写入
        if let Err(err) = self
            .deps
            .presence
            .set_status(&username, session.status)
            .await
        {
            warn!(username = %username, error = %err, "续期用户状态失败");
        }
        let present = retry_async(&self.retry, || {
            self.deps.presence.is_member(room_id, &username)
        })
        .await?;
        if !present {
            return Err(ApplicationError::forbidden("You are not in this room"));
        }

        // INCR 不幂等，失败不重试，否则一次发送可能被计数两次
        let flood = self.deps.rate_limiter.check_flood(&username).await?;
        if let RateDecision::Limited(err) = flood {
            let room_name = self.room_name(room_id).await;
            self.warn_sender(
                request.session_id,
                room_id,
                format!("{room_name} : Slow down! Wait a moment before sending another message."),
            )
            .await;
            info!(room_id = %room_id, username = %username, "触发刷屏限制");
            return Ok(SendOutcome::RateLimited(err));
        }

        let cooldown = retry_async(&self.retry, || {
            self.deps.rate_limiter.check_cooldown(user_id)
        })
        .await?;
        if let RateDecision::Limited(err) = cooldown {
            let wait_ms = match &err {
                RateLimitError::CooldownActive { retry_after }
                | RateLimitError::FloodExceeded { retry_after, .. } => retry_after.as_millis(),
            };
            self.warn_sender(
                request.session_id,
                room_id,
                format!("Please wait {wait_ms}ms before sending another message."),
            )
            .await;
            return Ok(SendOutcome::RateLimited(err));
        }

        let now = self.deps.clock.now();
        let message = ChatMessage::chat(room_id, user_id, username.as_str(), request.message, now)?;

        // 持久化失败不阻塞投递，使用本地生成的 id 与时间戳
        let message = match self.deps.messages.insert(&message).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(room_id = %room_id, message_id = %message.id, error = %err, "消息持久化失败，继续投递");
                message
            }
        };

        self.emit(MessageBroadcast::to_room(
            room_id,
            ServerEvent::ChatMessage(message.clone()),
        ))
        .await;

        let last = LastMessage {
            message: message.message.clone(),
            username: message.username.clone(),
            timestamp: message.timestamp,
        };
        if let Err(err) = self.deps.presence.set_last_message(room_id, &last).await {
            warn!(room_id = %room_id, error = %err, "更新最后消息失败");
        }
        self.notify_chat_lists(room_id).await;

        if self.deps.settings.message_reward > 0 {
            if let Err(err) = self
                .deps
                .rewards
                .grant(user_id, self.deps.settings.message_reward, RewardReason::SendMessage)
                .await
            {
                warn!(user_id = %user_id, error = %err, "发放经验失败");
            }
        }

        Ok(SendOutcome::Delivered(message))
    }

    /// 仅房间管理员可删除消息
    pub async fn delete_message(
        &self,
        request: DeleteMessageRequest,
    ) -> Result<(), ApplicationError> {
        let room_id = RoomId::from(request.room_id);
        let message_id = MessageId::from(request.message_id);
        let session = self
            .deps
            .sessions
            .authorize(request.session_id, None, None)
            .await?;

        if !self
            .deps
            .directory
            .is_room_admin(room_id, session.user_id)
            .await?
        {
            return Err(ApplicationError::forbidden(
                "You do not have admin rights in this room",
            ));
        }
        if !self.deps.messages.delete(message_id).await? {
            return Err(ApplicationError::not_found("message"));
        }

        self.emit(MessageBroadcast::to_room(
            room_id,
            ServerEvent::MessageDeleted {
                message_id,
                room_id,
            },
        ))
        .await;
        info!(room_id = %room_id, message_id = %message_id, user_id = %session.user_id, "消息已删除");
        Ok(())
    }

    /// 分页读取历史，`hasMore` 只按返回条数是否等于 limit 判断
    pub async fn get_messages(
        &self,
        request: GetMessagesRequest,
    ) -> Result<MessagePage, ApplicationError> {
        let room_id = RoomId::from(request.room_id);
        let settings = &self.deps.settings;
        let limit = request
            .limit
            .unwrap_or(settings.history_default_limit)
            .clamp(1, settings.history_max_limit);
        let offset = request.offset.unwrap_or(0);

        let messages = self.deps.messages.list(room_id, limit, offset).await?;
        Ok(MessagePage::new(room_id, messages, limit))
    }

    /// 用户所在房间及其最后消息
    pub async fn chat_list(&self, username: &Username) -> Result<ServerEvent, ApplicationError> {
        let rooms = retry_async(&self.retry, || self.deps.presence.user_rooms(username)).await?;

        let mut entries = Vec::with_capacity(rooms.len());
        for room_id in rooms {
            let room_name = self.room_name(room_id).await;
            let user_count =
                retry_async(&self.retry, || self.deps.presence.population(room_id)).await?;
            let last_message =
                retry_async(&self.retry, || self.deps.presence.last_message(room_id)).await?;
            entries.push(ChatListEntry {
                room_id,
                room_name,
                user_count,
                last_message,
            });
        }
        Ok(ServerEvent::ChatList { rooms: entries })
    }

    async fn notify_chat_lists(&self, room_id: RoomId) {
        let members = match self.deps.presence.members(room_id).await {
            Ok(members) => members,
            Err(err) => {
                warn!(room_id = %room_id, error = %err, "读取在线列表失败，跳过会话列表通知");
                return;
            }
        };
        for entry in members {
            self.emit(MessageBroadcast::to_user(
                entry.username,
                ServerEvent::ChatListUpdate { room_id },
            ))
            .await;
        }
    }

    async fn room_name(&self, room_id: RoomId) -> String {
        match self.deps.directory.find_by_id(room_id).await {
            Ok(Some(room)) => room.name,
            Ok(None) => room_id.to_string(),
            Err(err) => {
                warn!(room_id = %room_id, error = %err, "读取房间信息失败");
                room_id.to_string()
            }
        }
    }

    async fn warn_sender(&self, session_id: SessionId, room_id: RoomId, message: String) {
        self.emit(MessageBroadcast::to_session(
            session_id,
            ServerEvent::SystemMessage(SystemNotice {
                room_id: Some(room_id),
                message,
                level: NoticeLevel::Warning,
                timestamp: self.deps.clock.now(),
            }),
        ))
        .await;
    }

    async fn emit(&self, payload: MessageBroadcast) {
        let event = payload.event.name();
        if let Err(err) = self.deps.broadcaster.broadcast(payload).await {
            warn!(event, error = %err, "事件投递失败");
        }
    }
}
