//! 消息存储接口

use async_trait::async_trait;
use serde::Serialize;

use crate::entities::ChatMessage;
use crate::errors::RepositoryResult;
use crate::value_objects::{MessageId, RoomId};

/// 历史消息分页结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub room_id: RoomId,
    pub messages: Vec<ChatMessage>,
    /// 仅按“返回条数 == limit”估算，不保证下一页一定存在
    pub has_more: bool,
}

impl MessagePage {
    pub fn new(room_id: RoomId, messages: Vec<ChatMessage>, limit: u32) -> Self {
        let has_more = messages.len() == limit as usize;
        Self {
            room_id,
            messages,
            has_more,
        }
    }
}

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 保存消息，返回持久层确认后的版本（可能带有持久层的时间戳）
    async fn insert(&self, message: &ChatMessage) -> RepositoryResult<ChatMessage>;

    /// 删除消息，返回是否删除了记录
    async fn delete(&self, message_id: MessageId) -> RepositoryResult<bool>;

    /// 按时间倒序分页读取
    async fn list(&self, room_id: RoomId, limit: u32, offset: u32)
        -> RepositoryResult<Vec<ChatMessage>>;
}
