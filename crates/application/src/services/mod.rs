mod message_relay;
mod room_coordinator;

pub use message_relay::{
    DeleteMessageRequest, GetMessagesRequest, MessageRelay, MessageRelayDependencies,
    RelaySettings, SendMessageRequest, SendOutcome,
};
pub use room_coordinator::{
    CoordinatorSettings, JoinOutcome, JoinRoomRequest, LeaveOutcome, ModerationRequest,
    RoomCoordinator, RoomCoordinatorDependencies,
};
