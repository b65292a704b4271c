//! 房间封禁列表接口

use async_trait::async_trait;

use crate::entities::BanEntry;
use crate::errors::RepositoryResult;
use crate::value_objects::{RoomId, UserId, Username};

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait BanRepository: Send + Sync {
    /// 按用户ID或用户名任一匹配即视为已封禁
    async fn is_banned(
        &self,
        room_id: RoomId,
        user_id: UserId,
        username: &Username,
    ) -> RepositoryResult<bool>;

    /// 记录封禁，重复封禁覆盖原记录
    async fn ban(&self, entry: BanEntry) -> RepositoryResult<()>;

    /// 解除封禁，返回是否存在被移除的记录
    async fn unban(
        &self,
        room_id: RoomId,
        user_id: UserId,
        username: &Username,
    ) -> RepositoryResult<bool>;

    /// 房间当前的封禁列表
    async fn list_bans(&self, room_id: RoomId) -> RepositoryResult<Vec<BanEntry>>;
}
