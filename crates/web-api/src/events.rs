//! 客户端入站事件
//!
//! 帧格式为 `{"event": "...", "data": {...}}`，无负载的事件可以省略 `data`。

use domain::UserStatus;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    /// 重连时携带上一个会话 ID
    pub resume_session: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeavePayload {
    pub room_id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPayload {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletePayload {
    pub message_id: Uuid,
    pub room_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPayload {
    pub room_id: Uuid,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationPayload {
    pub room_id: Uuid,
    pub target_user_id: Uuid,
    pub target_username: String,
    pub admin_id: Uuid,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    pub room_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusPayload {
    pub status: UserStatus,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Join(JoinPayload),
    Leave(LeavePayload),
    SendMessage(SendPayload),
    DeleteMessage(DeletePayload),
    GetMessages(HistoryPayload),
    Kick(ModerationPayload),
    Ban(ModerationPayload),
    Unban(ModerationPayload),
    GetRoomUsers(RoomPayload),
    GetRoomInfo(RoomPayload),
    GetChatList,
    SetStatus(StatusPayload),
    SubscribeRooms,
    UnsubscribeRooms,
    Suspend,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum EventParseError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("invalid payload for `{event}`: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, EventParseError> {
        let Envelope { event, data } = serde_json::from_str(text)?;

        let event = match event.as_str() {
            "room:join" => ClientEvent::Join(payload(&event, data)?),
            "room:leave" => ClientEvent::Leave(payload(&event, data)?),
            "chat:message" => ClientEvent::SendMessage(payload(&event, data)?),
            "chat:message:delete" => ClientEvent::DeleteMessage(payload(&event, data)?),
            "chat:messages:get" => ClientEvent::GetMessages(payload(&event, data)?),
            "room:admin:kick" => ClientEvent::Kick(payload(&event, data)?),
            "room:admin:ban" => ClientEvent::Ban(payload(&event, data)?),
            "room:admin:unban" => ClientEvent::Unban(payload(&event, data)?),
            "room:users:get" => ClientEvent::GetRoomUsers(payload(&event, data)?),
            "room:info:get" => ClientEvent::GetRoomInfo(payload(&event, data)?),
            "chatlist:get" => ClientEvent::GetChatList,
            "presence:set" => ClientEvent::SetStatus(payload(&event, data)?),
            "rooms:subscribe" => ClientEvent::SubscribeRooms,
            "rooms:unsubscribe" => ClientEvent::UnsubscribeRooms,
            "session:suspend" => ClientEvent::Suspend,
            _ => return Err(EventParseError::UnknownEvent(event)),
        };
        Ok(event)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join(_) => "room:join",
            ClientEvent::Leave(_) => "room:leave",
            ClientEvent::SendMessage(_) => "chat:message",
            ClientEvent::DeleteMessage(_) => "chat:message:delete",
            ClientEvent::GetMessages(_) => "chat:messages:get",
            ClientEvent::Kick(_) => "room:admin:kick",
            ClientEvent::Ban(_) => "room:admin:ban",
            ClientEvent::Unban(_) => "room:admin:unban",
            ClientEvent::GetRoomUsers(_) => "room:users:get",
            ClientEvent::GetRoomInfo(_) => "room:info:get",
            ClientEvent::GetChatList => "chatlist:get",
            ClientEvent::SetStatus(_) => "presence:set",
            ClientEvent::SubscribeRooms => "rooms:subscribe",
            ClientEvent::UnsubscribeRooms => "rooms:unsubscribe",
            ClientEvent::Suspend => "session:suspend",
        }
    }
}

fn payload<T: DeserializeOwned>(event: &str, data: serde_json::Value) -> Result<T, EventParseError> {
    serde_json::from_value(data).map_err(|source| EventParseError::InvalidPayload {
        event: event.to_string(),
        source,
    })
}
