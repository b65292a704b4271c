//! 基础设施层实现。
//!
//! 提供 Postgres 仓储、内存协作者以及按配置组装后端的构建器，实现领域层定义的协作者接口。

pub mod builder;
pub mod memory;
pub mod migrations;
pub mod repository;

pub use builder::{Infrastructure, InfrastructureError, LOBBY_ROOM_ID};
pub use memory::{
    MemoryBanRepository, MemoryMessageRepository, MemoryRewardService, MemoryRoomDirectory,
};
pub use migrations::MIGRATOR;
pub use repository::{
    create_pg_pool, PgBanRepository, PgMessageRepository, PgRewardService, PgRoomDirectory,
    PgStorage,
};
