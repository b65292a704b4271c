//! 在线状态相关实体

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{RoomId, Timestamp, Username};

/// 用户在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Away,
    Busy,
    /// 状态键过期或不存在时的取值
    #[default]
    Offline,
    Invisible,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Away => "away",
            UserStatus::Busy => "busy",
            UserStatus::Offline => "offline",
            UserStatus::Invisible => "invisible",
        }
    }

    /// 对其他用户展示的状态，隐身用户显示为离线
    pub fn visible(self) -> Self {
        match self {
            UserStatus::Invisible => UserStatus::Offline,
            other => other,
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(UserStatus::Online),
            "away" => Ok(UserStatus::Away),
            "busy" => Ok(UserStatus::Busy),
            "offline" => Ok(UserStatus::Offline),
            "invisible" => Ok(UserStatus::Invisible),
            other => Err(DomainError::invalid_argument(
                "status",
                format!("unknown status `{other}`"),
            )),
        }
    }
}

/// 房间在线条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub room_id: RoomId,
    pub username: Username,
    pub joined_at: Timestamp,
}

/// 房间最后一条消息摘要，供会话列表使用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub message: String,
    pub username: String,
    pub timestamp: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            UserStatus::Online,
            UserStatus::Away,
            UserStatus::Busy,
            UserStatus::Offline,
            UserStatus::Invisible,
        ] {
            assert_eq!(status.as_str().parse::<UserStatus>().unwrap(), status);
        }
        assert!("sleeping".parse::<UserStatus>().is_err());
    }

    #[test]
    fn invisible_is_shown_as_offline() {
        assert_eq!(UserStatus::Invisible.visible(), UserStatus::Offline);
        assert_eq!(UserStatus::Busy.visible(), UserStatus::Busy);
    }
}
