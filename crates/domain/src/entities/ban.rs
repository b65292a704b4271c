use serde::{Deserialize, Serialize};

use crate::value_objects::{RoomId, Timestamp, UserId, Username};

/// 房间封禁记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanEntry {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: Username,
    pub banned_by: UserId,
    pub reason: Option<String>,
    pub banned_at: Timestamp,
}
