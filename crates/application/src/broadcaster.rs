//! 出站事件与广播抽象
//!
//! 所有推送给客户端的事件都序列化为 `{"event": "...", "data": {...}}`。

use async_trait::async_trait;
use domain::{
    ChatMessage, LastMessage, MessageId, MessagePage, Room, RoomId, SessionId, Timestamp, UserId,
    UserStatus, Username,
};
use serde::Serialize;
use thiserror::Error;

/// 广播通道
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// 房间内所有会话
    Room(RoomId),
    /// 某个用户的全部会话
    User(Username),
    /// 订阅了房间人数变化的会话
    RoomList,
}

/// 投递目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Session(SessionId),
    Channel(Channel),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub username: Username,
    pub status: UserStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// 与普通聊天消息区分的提示（限流警告、管理操作）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemNotice {
    pub room_id: Option<RoomId>,
    pub message: String,
    #[serde(rename = "type")]
    pub level: NoticeLevel,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatListEntry {
    pub room_id: RoomId,
    pub room_name: String,
    pub user_count: u64,
    pub last_message: Option<LastMessage>,
}

/// 服务端推送事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "session:ready")]
    SessionReady {
        session_id: SessionId,
        user_id: UserId,
        username: Username,
    },
    #[serde(rename = "chat:message")]
    ChatMessage(ChatMessage),
    #[serde(rename = "chat:messages")]
    Messages(MessagePage),
    #[serde(rename = "chat:message:deleted")]
    MessageDeleted {
        message_id: MessageId,
        room_id: RoomId,
    },
    #[serde(rename = "system:message")]
    SystemMessage(SystemNotice),
    #[serde(rename = "room:joined")]
    RoomJoined {
        room_id: RoomId,
        room: Room,
        users: Vec<RosterEntry>,
        user_count: u64,
        resumed: bool,
    },
    #[serde(rename = "room:left")]
    RoomLeft { room_id: RoomId },
    #[serde(rename = "room:user:joined")]
    UserJoined {
        room_id: RoomId,
        username: Username,
        users: Vec<RosterEntry>,
    },
    #[serde(rename = "room:user:left")]
    UserLeft {
        room_id: RoomId,
        username: Username,
        users: Vec<RosterEntry>,
    },
    #[serde(rename = "room:user:kicked")]
    UserKicked {
        room_id: RoomId,
        user_id: UserId,
        username: Username,
    },
    #[serde(rename = "room:user:banned")]
    UserBanned {
        room_id: RoomId,
        user_id: UserId,
        username: Username,
        reason: Option<String>,
    },
    #[serde(rename = "room:user:unbanned")]
    UserUnbanned {
        room_id: RoomId,
        user_id: UserId,
        username: Username,
    },
    #[serde(rename = "room:users")]
    RoomUsers {
        room_id: RoomId,
        users: Vec<RosterEntry>,
        count: u64,
    },
    #[serde(rename = "room:info")]
    RoomInfo {
        room: Room,
        users: Vec<RosterEntry>,
        user_count: u64,
        recent_notices: Vec<String>,
    },
    #[serde(rename = "rooms:updateCount")]
    RoomCount {
        room_id: RoomId,
        user_count: u64,
        max_users: u32,
    },
    #[serde(rename = "chatlist:update")]
    ChatListUpdate { room_id: RoomId },
    #[serde(rename = "chatlist")]
    ChatList { rooms: Vec<ChatListEntry> },
    #[serde(rename = "presence:status")]
    Status {
        username: Username,
        status: UserStatus,
    },
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::SessionReady { .. } => "session:ready",
            ServerEvent::ChatMessage(_) => "chat:message",
            ServerEvent::Messages(_) => "chat:messages",
            ServerEvent::MessageDeleted { .. } => "chat:message:deleted",
            ServerEvent::SystemMessage(_) => "system:message",
            ServerEvent::RoomJoined { .. } => "room:joined",
            ServerEvent::RoomLeft { .. } => "room:left",
            ServerEvent::UserJoined { .. } => "room:user:joined",
            ServerEvent::UserLeft { .. } => "room:user:left",
            ServerEvent::UserKicked { .. } => "room:user:kicked",
            ServerEvent::UserBanned { .. } => "room:user:banned",
            ServerEvent::UserUnbanned { .. } => "room:user:unbanned",
            ServerEvent::RoomUsers { .. } => "room:users",
            ServerEvent::RoomInfo { .. } => "room:info",
            ServerEvent::RoomCount { .. } => "rooms:updateCount",
            ServerEvent::ChatListUpdate { .. } => "chatlist:update",
            ServerEvent::ChatList { .. } => "chatlist",
            ServerEvent::Status { .. } => "presence:status",
            ServerEvent::Error { .. } => "error",
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageBroadcast {
    pub target: Target,
    pub event: ServerEvent,
}

impl MessageBroadcast {
    pub fn to_session(session_id: SessionId, event: ServerEvent) -> Self {
        Self {
            target: Target::Session(session_id),
            event,
        }
    }

    pub fn to_room(room_id: RoomId, event: ServerEvent) -> Self {
        Self {
            target: Target::Channel(Channel::Room(room_id)),
            event,
        }
    }

    pub fn to_user(username: Username, event: ServerEvent) -> Self {
        Self {
            target: Target::Channel(Channel::User(username)),
            event,
        }
    }

    pub fn to_room_list(event: ServerEvent) -> Self {
        Self {
            target: Target::Channel(Channel::RoomList),
            event,
        }
    }
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast failed: {0}")]
    Failed(String),
}

impl BroadcastError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[async_trait]
pub trait MessageBroadcaster: Send + Sync {
    /// 投递事件；同一会话收到的事件保持投递顺序
    async fn broadcast(&self, payload: MessageBroadcast) -> Result<(), BroadcastError>;

    async fn subscribe(&self, session_id: SessionId, channel: Channel)
        -> Result<(), BroadcastError>;

    async fn unsubscribe(
        &self,
        session_id: SessionId,
        channel: &Channel,
    ) -> Result<(), BroadcastError>;
}
