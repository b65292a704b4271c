use application::{
    ApplicationError, DeleteMessageRequest, GetMessagesRequest, JoinRoomRequest,
    MessageBroadcast, MessageBroadcaster, ModerationRequest, SendMessageRequest, ServerEvent,
};
use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::{RoomId, SessionId, UserId, Username};
use futures_util::{SinkExt, Stream, StreamExt};
use std::future::Future;
use std::ops::ControlFlow;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::Identity;
use crate::error::ApiError;
use crate::events::{ClientEvent, ModerationPayload};
use crate::state::AppState;

/// WebSocket 连接管理器
///
/// 一个连接对应一个会话：
/// - 出站事件来自连接中心分配给会话的有界队列
/// - 入站事件在接收循环里按到达顺序逐条处理
/// - 连接关闭时注销队列并按会话状态清理房间
pub struct WebSocketConnection {
    state: AppState,
    session_id: SessionId,
    identity: Identity,
}

impl WebSocketConnection {
    /// 注册会话并推送 `session:ready`
    pub async fn open(
        state: AppState,
        identity: Identity,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>), ApiError> {
        let session_id = SessionId::generate();
        let outbox = state.hub.register(session_id).await;

        if let Err(err) = state
            .coordinator
            .connect(session_id, identity.user_id, identity.username.clone())
            .await
        {
            state.hub.unregister(session_id).await;
            return Err(err.into());
        }

        tracing::info!(
            session_id = %session_id,
            user_id = %identity.user_id,
            username = %identity.username,
            "WebSocket 连接已建立"
        );
        Ok((
            Self {
                state,
                session_id,
                identity,
            },
            outbox,
        ))
    }

    /// 运行连接主循环，直到任意一端关闭
    pub async fn run(self, socket: WebSocket, mut outbox: mpsc::Receiver<ServerEvent>) {
        let (mut sender, incoming) = socket.split();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        // 发送任务：统一处理所有对 WebSocket sender 的写操作
        let mut send_task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    Some(cmd) = cmd_rx.recv() => match cmd {
                        WsCommand::SendPong(data) => WsMessage::Pong(data),
                    },
                    event = outbox.recv() => {
                        // 队列被注销说明会话已结束
                        let Some(event) = event else { break };
                        match serde_json::to_string(&event) {
                            Ok(json) => WsMessage::Text(json.into()),
                            Err(err) => {
                                tracing::warn!(error = %err, event = event.name(), "failed to serialize websocket payload");
                                continue;
                            }
                        }
                    }
                };
                if sender.send(frame).await.is_err() {
                    tracing::warn!("Failed to send websocket frame");
                    break;
                }
            }
            tracing::debug!("WebSocket发送任务结束");
        });

        let this = &self;
        let cmd_tx = &cmd_tx;
        receive_until_closed(incoming, &mut send_task, move |message| {
            this.on_frame(message, cmd_tx)
        })
        .await;
        tracing::debug!(session_id = %self.session_id, "WebSocket接收循环结束");

        self.state.hub.unregister(self.session_id).await;
        self.state.coordinator.detach(self.session_id).await;
        send_task.abort();

        tracing::info!(
            session_id = %self.session_id,
            username = %self.identity.username,
            "WebSocket连接已断开"
        );
    }

    async fn on_frame(
        &self,
        message: WsMessage,
        cmd_tx: &mpsc::Sender<WsCommand>,
    ) -> ControlFlow<()> {
        match message {
            WsMessage::Text(text) => self.dispatch(text.as_str()).await,
            WsMessage::Ping(data) => {
                // 心跳也算活动
                self.state.coordinator.touch(self.session_id).await;
                if cmd_tx.send(WsCommand::SendPong(data)).await.is_err() {
                    return ControlFlow::Break(());
                }
            }
            WsMessage::Close(_) => {
                tracing::debug!(session_id = %self.session_id, "WebSocket收到关闭消息");
                return ControlFlow::Break(());
            }
            WsMessage::Pong(_) | WsMessage::Binary(_) => {}
        }
        ControlFlow::Continue(())
    }

    /// 解析并处理单个入站帧，失败只回复给本会话
    async fn dispatch(&self, text: &str) {
        let event = match ClientEvent::parse(text) {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(session_id = %self.session_id, error = %err, "无法解析客户端事件");
                self.reply(ServerEvent::error("VALIDATION_ERROR", err.to_string()))
                    .await;
                return;
            }
        };

        let name = event.name();
        if let Err(err) = self.handle(event).await {
            tracing::debug!(
                session_id = %self.session_id,
                event = name,
                code = err.code(),
                error = %err,
                "客户端事件处理失败"
            );
            self.reply(ServerEvent::error(err.code(), err.to_string()))
                .await;
        }
    }

    async fn handle(&self, event: ClientEvent) -> Result<(), ApplicationError> {
        let state = &self.state;
        match event {
            ClientEvent::Join(payload) => {
                state
                    .coordinator
                    .join(JoinRoomRequest {
                        session_id: self.session_id,
                        room_id: payload.room_id,
                        user_id: payload.user_id,
                        username: payload.username,
                        resume_from: payload.resume_session.map(SessionId::from),
                    })
                    .await?;
            }
            ClientEvent::Leave(payload) => {
                let username = Username::parse(payload.username)?;
                state
                    .coordinator
                    .authorize(self.session_id, None, Some(&username))
                    .await?;
                state
                    .coordinator
                    .leave(RoomId::from(payload.room_id), &username)
                    .await?;
            }
            ClientEvent::SendMessage(payload) => {
                // 限流结果已由中继以警告形式推送给本会话
                state
                    .relay
                    .send_message(SendMessageRequest {
                        session_id: self.session_id,
                        room_id: payload.room_id,
                        user_id: payload.user_id,
                        username: payload.username,
                        message: payload.message,
                    })
                    .await?;
            }
            ClientEvent::DeleteMessage(payload) => {
                state
                    .relay
                    .delete_message(DeleteMessageRequest {
                        session_id: self.session_id,
                        room_id: payload.room_id,
                        message_id: payload.message_id,
                    })
                    .await?;
            }
            ClientEvent::GetMessages(payload) => {
                let page = state
                    .relay
                    .get_messages(GetMessagesRequest {
                        room_id: payload.room_id,
                        limit: payload.limit,
                        offset: payload.offset,
                    })
                    .await?;
                self.reply(ServerEvent::Messages(page)).await;
            }
            ClientEvent::Kick(payload) => {
                let request = self.moderation_request(payload).await?;
                state.coordinator.kick(request).await?;
            }
            ClientEvent::Ban(payload) => {
                let request = self.moderation_request(payload).await?;
                state.coordinator.ban(request).await?;
            }
            ClientEvent::Unban(payload) => {
                let request = self.moderation_request(payload).await?;
                let ack = state.coordinator.unban(request).await?;
                self.reply(ack).await;
            }
            ClientEvent::GetRoomUsers(payload) => {
                let users = state
                    .coordinator
                    .room_users(RoomId::from(payload.room_id))
                    .await?;
                self.reply(users).await;
            }
            ClientEvent::GetRoomInfo(payload) => {
                let info = state
                    .coordinator
                    .room_info(RoomId::from(payload.room_id))
                    .await?;
                self.reply(info).await;
            }
            ClientEvent::GetChatList => {
                let list = state.relay.chat_list(&self.identity.username).await?;
                self.reply(list).await;
            }
            ClientEvent::SetStatus(payload) => {
                let ack = state
                    .coordinator
                    .set_status(self.session_id, payload.status)
                    .await?;
                self.reply(ack).await;
            }
            ClientEvent::SubscribeRooms => {
                state.coordinator.subscribe_room_list(self.session_id).await;
            }
            ClientEvent::UnsubscribeRooms => {
                state
                    .coordinator
                    .unsubscribe_room_list(self.session_id)
                    .await;
            }
            ClientEvent::Suspend => {
                state.coordinator.suspend(self.session_id).await?;
            }
        }
        Ok(())
    }

    /// 管理操作的 adminId 必须是本会话的身份
    async fn moderation_request(
        &self,
        payload: ModerationPayload,
    ) -> Result<ModerationRequest, ApplicationError> {
        self.state
            .coordinator
            .authorize(self.session_id, Some(UserId::from(payload.admin_id)), None)
            .await?;
        Ok(ModerationRequest {
            room_id: payload.room_id,
            target_user_id: payload.target_user_id,
            target_username: payload.target_username,
            admin_id: payload.admin_id,
            reason: payload.reason,
        })
    }

    async fn reply(&self, event: ServerEvent) {
        if let Err(err) = self
            .state
            .hub
            .broadcast(MessageBroadcast::to_session(self.session_id, event))
            .await
        {
            tracing::warn!(session_id = %self.session_id, error = %err, "回复客户端失败");
        }
    }
}

/// 逐帧处理入站消息，直到对端关闭、处理函数要求结束或发送任务退出。
///
/// 发送任务退出只在等待下一帧时生效：已开始处理的帧总是执行完，
/// 加入流程不会停在写入在线条目之后、登记会话房间之前。
async fn receive_until_closed<S, E, H, Fut>(
    mut incoming: S,
    send_task: &mut JoinHandle<()>,
    mut on_frame: H,
) where
    S: Stream<Item = Result<WsMessage, E>> + Unpin,
    H: FnMut(WsMessage) -> Fut,
    Fut: Future<Output = ControlFlow<()>>,
{
    loop {
        let next = tokio::select! {
            biased;
            next = incoming.next() => next,
            _ = &mut *send_task => return,
        };
        let Some(Ok(message)) = next else {
            return;
        };
        if on_frame(message).await.is_break() {
            return;
        }
    }
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendPong(Bytes),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn frame_in_progress_completes_after_sender_stops() {
        let frames = futures_util::stream::iter(vec![Ok::<_, Infallible>(WsMessage::Text(
            String::from("join").into(),
        ))])
        .chain(futures_util::stream::pending());
        // 发送任务立即结束，模拟对端已不可写
        let mut send_task = tokio::spawn(async {});
        let handled = Arc::new(AtomicUsize::new(0));

        let counter = handled.clone();
        receive_until_closed(frames, &mut send_task, move |_| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            }
        })
        .await;

        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_request_from_handler_stops_the_loop() {
        let frames = futures_util::stream::iter(vec![
            Ok::<_, Infallible>(WsMessage::Close(None)),
            Ok(WsMessage::Text(String::from("after close").into())),
        ]);
        let mut send_task = tokio::spawn(std::future::pending::<()>());
        let handled = Arc::new(AtomicUsize::new(0));

        let counter = handled.clone();
        receive_until_closed(frames, &mut send_task, move |message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if matches!(message, WsMessage::Close(_)) {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
        })
        .await;
        send_task.abort();

        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }
}
