//! 房间元数据（由持久化协作者拥有，核心只读）

use serde::{Deserialize, Serialize};

use crate::value_objects::{RoomId, UserId};

/// 未配置容量时的默认房间人数上限
pub const DEFAULT_MAX_USERS: u32 = 25;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub description: Option<String>,
    pub max_users: u32,
    pub is_private: bool,
    pub owner_id: UserId,
    pub owner_name: Option<String>,
}

impl Room {
    /// 欢迎语中“管理者”的显示名
    pub fn manager_name(&self) -> &str {
        self.owner_name.as_deref().unwrap_or("admin")
    }

    pub fn is_full(&self, population: u64) -> bool {
        population >= u64::from(self.max_users)
    }
}
