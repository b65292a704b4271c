//! 实时房间在线状态与消息中继的领域模型
//!
//! 包含房间、消息、在线状态、封禁记录等核心实体，以及持久化协作者的接口定义。

pub mod entities;
pub mod errors;
pub mod repositories;
pub mod services;
pub mod value_objects;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use repositories::*;
pub use services::*;
pub use value_objects::*;
