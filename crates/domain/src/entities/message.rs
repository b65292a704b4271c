//! 消息实体定义
//!
//! 聊天消息的规范信封：{id, roomId, userId, username, message, messageType, timestamp}。

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{MessageId, RoomId, Timestamp, UserId};

/// 单条消息最大字符数
pub const MAX_MESSAGE_LEN: usize = 1000;

/// 消息类型枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// 用户聊天消息
    #[default]
    Chat,
    /// 系统消息（欢迎、进入、离开）
    System,
    /// 提示消息（限流警告、管理操作）
    Notice,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Chat => "chat",
            MessageType::System => "system",
            MessageType::Notice => "notice",
        }
    }

    pub fn parse(value: &str) -> DomainResult<Self> {
        match value {
            "chat" => Ok(MessageType::Chat),
            "system" => Ok(MessageType::System),
            "notice" => Ok(MessageType::Notice),
            other => Err(DomainError::invalid_argument(
                "message_type",
                format!("unknown message type `{other}`"),
            )),
        }
    }
}

/// 聊天消息实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: Option<UserId>,
    pub username: String,
    pub message: String,
    pub message_type: MessageType,
    pub timestamp: Timestamp,
}

impl ChatMessage {
    /// 创建用户消息，校验内容长度
    pub fn chat(
        room_id: RoomId,
        user_id: UserId,
        username: impl Into<String>,
        message: impl Into<String>,
        now: Timestamp,
    ) -> DomainResult<Self> {
        let message = message.into();
        validate_content(&message)?;

        Ok(Self {
            id: MessageId::generate(),
            room_id,
            user_id: Some(user_id),
            username: username.into(),
            message,
            message_type: MessageType::Chat,
            timestamp: now,
        })
    }

    /// 创建系统消息，发送者显示为房间名
    pub fn system(
        room_id: RoomId,
        room_name: impl Into<String>,
        message: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            room_id,
            user_id: None,
            username: room_name.into(),
            message: message.into(),
            message_type: MessageType::System,
            timestamp: now,
        }
    }
}

/// 校验消息内容：非空且不超过最大长度（按字符计）
pub fn validate_content(message: &str) -> DomainResult<()> {
    if message.trim().is_empty() {
        return Err(DomainError::invalid_argument("message", "cannot be empty"));
    }
    let len = message.chars().count();
    if len > MAX_MESSAGE_LEN {
        return Err(DomainError::invalid_argument(
            "message",
            format!("too long ({len} > {MAX_MESSAGE_LEN} characters)"),
        ));
    }
    Ok(())
}
