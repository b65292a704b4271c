//! 经验值奖励接口（黑盒副作用）

use std::fmt;

use async_trait::async_trait;

use crate::errors::RepositoryResult;
use crate::value_objects::UserId;

/// 奖励原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardReason {
    JoinRoom,
    SendMessage,
}

impl RewardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardReason::JoinRoom => "join_room",
            RewardReason::SendMessage => "send_message",
        }
    }
}

impl fmt::Display for RewardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait RewardService: Send + Sync {
    async fn grant(&self, user_id: UserId, amount: u32, reason: RewardReason)
        -> RepositoryResult<()>;
}
