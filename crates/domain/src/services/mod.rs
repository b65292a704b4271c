//! 领域服务接口

pub mod reward_service;

pub use reward_service::{RewardReason, RewardService};

#[cfg(feature = "testing")]
pub use reward_service::MockRewardService;
