//! 房间目录接口

use async_trait::async_trait;

use crate::entities::Room;
use crate::errors::RepositoryResult;
use crate::value_objects::{RoomId, UserId};

/// 房间元数据查询（只读为主）
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// 根据ID查找房间
    async fn find_by_id(&self, room_id: RoomId) -> RepositoryResult<Option<Room>>;

    /// 根据名称查找房间
    async fn find_by_name(&self, name: &str) -> RepositoryResult<Option<Room>>;

    /// 用户是否拥有该房间的管理权限（房主或管理员）
    async fn is_room_admin(&self, room_id: RoomId, user_id: UserId) -> RepositoryResult<bool>;
}
