//! 应用层实现。
//!
//! 房间协调器与消息中继两个用例服务，以及它们依赖的抽象：
//! 在线状态存储、限流器、广播器、会话注册表。

pub mod broadcaster;
pub mod clock;
pub mod error;
pub mod local_broadcast;
pub mod presence;
pub mod rate_limiter;
pub mod retry;
pub mod services;
pub mod session;

pub use broadcaster::{
    BroadcastError, Channel, ChatListEntry, MessageBroadcast, MessageBroadcaster, NoticeLevel,
    RosterEntry, ServerEvent, SystemNotice, Target,
};
pub use clock::{Clock, SystemClock};
pub use error::ApplicationError;
pub use local_broadcast::LocalMessageBroadcaster;
pub use presence::{AddOutcome, PresenceStore, RedisPresenceStore, RemoveOutcome};
pub use rate_limiter::{RateDecision, RateLimitError, RateLimiter, RedisRateLimiter};
pub use retry::{retry_async, Backoff, RetryConfig};
pub use services::{
    CoordinatorSettings, DeleteMessageRequest, GetMessagesRequest, JoinOutcome, JoinRoomRequest,
    LeaveOutcome, MessageRelay, MessageRelayDependencies, ModerationRequest, RelaySettings,
    RoomCoordinator, RoomCoordinatorDependencies, SendMessageRequest, SendOutcome,
};
pub use session::{GraceKey, SessionInfo, SessionRegistry};
