//! Web API 层。
//!
//! 提供 Axum 路由：HTTP 查询接口与 WebSocket 会话，请求委托给应用层的房间协调器与消息中继。

mod auth;
mod error;
mod events;
mod routes;
mod state;
mod ws_connection;

pub use auth::{Claims, Identity, JwtService};
pub use error::ApiError;
pub use events::ClientEvent;
pub use routes::router;
pub use state::AppState;
