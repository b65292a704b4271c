//! 持久化协作者接口定义
//!
//! 房间目录、封禁列表和消息存储由外部持久层拥有，核心只通过这里的接口访问。

pub mod ban_repository;
pub mod message_repository;
pub mod room_directory;

pub use ban_repository::BanRepository;
pub use message_repository::{MessagePage, MessageRepository};
pub use room_directory::RoomDirectory;

#[cfg(feature = "testing")]
pub use ban_repository::MockBanRepository;
#[cfg(feature = "testing")]
pub use message_repository::MockMessageRepository;
#[cfg(feature = "testing")]
pub use room_directory::MockRoomDirectory;
