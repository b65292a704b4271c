//! 进程内广播器
//!
//! 每个会话一个有界出站队列，通道订阅关系保存在内存中。
//! 投递在持锁期间同步完成，同一会话的事件顺序与调用顺序一致。

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use domain::SessionId;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::broadcaster::{
    BroadcastError, Channel, MessageBroadcast, MessageBroadcaster, ServerEvent, Target,
};

#[derive(Default)]
struct HubState {
    sessions: HashMap<SessionId, mpsc::Sender<ServerEvent>>,
    channels: HashMap<Channel, BTreeSet<SessionId>>,
    session_channels: HashMap<SessionId, HashSet<Channel>>,
}

pub struct LocalMessageBroadcaster {
    state: RwLock<HubState>,
    queue_capacity: usize,
}

impl LocalMessageBroadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// 注册会话，返回其出站队列的接收端
    pub async fn register(&self, session_id: SessionId) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mut state = self.state.write().await;
        state.sessions.insert(session_id, tx);
        state.session_channels.entry(session_id).or_default();
        debug!(session_id = %session_id, "会话已注册到广播器");
        rx
    }

    /// 注销会话并退订全部通道
    pub async fn unregister(&self, session_id: SessionId) {
        let mut state = self.state.write().await;
        state.sessions.remove(&session_id);
        if let Some(channels) = state.session_channels.remove(&session_id) {
            for channel in channels {
                if let Some(members) = state.channels.get_mut(&channel) {
                    members.remove(&session_id);
                    if members.is_empty() {
                        state.channels.remove(&channel);
                    }
                }
            }
        }
        debug!(session_id = %session_id, "会话已从广播器注销");
    }

    /// 通道当前的订阅会话
    pub async fn subscribers(&self, channel: &Channel) -> Vec<SessionId> {
        let state = self.state.read().await;
        state
            .channels
            .get(channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    fn deliver(
        sessions: &HashMap<SessionId, mpsc::Sender<ServerEvent>>,
        session_id: SessionId,
        event: ServerEvent,
    ) {
        let Some(tx) = sessions.get(&session_id) else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    session_id = %session_id,
                    event = event.name(),
                    "出站队列已满，丢弃事件"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session_id = %session_id, "会话出站队列已关闭");
            }
        }
    }
}

#[async_trait]
impl MessageBroadcaster for LocalMessageBroadcaster {
    async fn broadcast(&self, payload: MessageBroadcast) -> Result<(), BroadcastError> {
        let state = self.state.read().await;
        match payload.target {
            Target::Session(session_id) => {
                Self::deliver(&state.sessions, session_id, payload.event);
            }
            Target::Channel(channel) => {
                if let Some(members) = state.channels.get(&channel) {
                    for session_id in members {
                        Self::deliver(&state.sessions, *session_id, payload.event.clone());
                    }
                }
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        session_id: SessionId,
        channel: Channel,
    ) -> Result<(), BroadcastError> {
        let mut state = self.state.write().await;
        if !state.sessions.contains_key(&session_id) {
            return Err(BroadcastError::failed(format!(
                "session {session_id} is not registered"
            )));
        }
        state
            .session_channels
            .entry(session_id)
            .or_default()
            .insert(channel.clone());
        state.channels.entry(channel).or_default().insert(session_id);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        session_id: SessionId,
        channel: &Channel,
    ) -> Result<(), BroadcastError> {
        let mut state = self.state.write().await;
        if let Some(channels) = state.session_channels.get_mut(&session_id) {
            channels.remove(channel);
        }
        if let Some(members) = state.channels.get_mut(channel) {
            members.remove(&session_id);
            if members.is_empty() {
                state.channels.remove(channel);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{RoomId, Username};
    use uuid::Uuid;

    fn room_event(room_id: RoomId) -> ServerEvent {
        ServerEvent::ChatListUpdate { room_id }
    }

    #[tokio::test]
    async fn room_broadcast_reaches_only_subscribers() {
        let hub = LocalMessageBroadcaster::new(8);
        let room_id = RoomId::from(Uuid::new_v4());
        let (a, b) = (SessionId::generate(), SessionId::generate());
        let mut rx_a = hub.register(a).await;
        let mut rx_b = hub.register(b).await;

        hub.subscribe(a, Channel::Room(room_id)).await.unwrap();
        hub.broadcast(MessageBroadcast::to_room(room_id, room_event(room_id)))
            .await
            .unwrap();

        assert_eq!(rx_a.try_recv().unwrap().name(), "chatlist:update");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_session_order_is_preserved() {
        let hub = LocalMessageBroadcaster::new(8);
        let session = SessionId::generate();
        let mut rx = hub.register(session).await;
        let alice = Username::parse("alice").unwrap();
        hub.subscribe(session, Channel::User(alice.clone()))
            .await
            .unwrap();

        hub.broadcast(MessageBroadcast::to_session(
            session,
            ServerEvent::error("A", "first"),
        ))
        .await
        .unwrap();
        hub.broadcast(MessageBroadcast::to_user(alice, ServerEvent::error("B", "second")))
            .await
            .unwrap();

        let codes: Vec<String> = [rx.try_recv().unwrap(), rx.try_recv().unwrap()]
            .into_iter()
            .map(|event| match event {
                ServerEvent::Error { code, .. } => code,
                other => panic!("unexpected event {}", other.name()),
            })
            .collect();
        assert_eq!(codes, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn unregister_drops_subscriptions() {
        let hub = LocalMessageBroadcaster::new(8);
        let session = SessionId::generate();
        let room_id = RoomId::from(Uuid::new_v4());
        let _rx = hub.register(session).await;
        hub.subscribe(session, Channel::Room(room_id)).await.unwrap();

        hub.unregister(session).await;
        assert!(hub.subscribers(&Channel::Room(room_id)).await.is_empty());
        assert!(hub.subscribe(session, Channel::RoomList).await.is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let hub = LocalMessageBroadcaster::new(1);
        let session = SessionId::generate();
        let room_id = RoomId::from(Uuid::new_v4());
        let mut rx = hub.register(session).await;

        for _ in 0..3 {
            hub.broadcast(MessageBroadcast::to_session(session, room_event(room_id)))
                .await
                .unwrap();
        }
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
