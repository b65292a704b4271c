//! 领域实体定义
//!
//! 房间元数据、聊天消息、在线状态与封禁记录。

pub mod ban;
pub mod message;
pub mod presence;
pub mod room;

// 重新导出核心实体
pub use ban::BanEntry;
pub use message::{ChatMessage, MessageType, MAX_MESSAGE_LEN};
pub use presence::{LastMessage, PresenceEntry, UserStatus};
pub use room::Room;
