#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use config::AppConfig;
use futures_util::{SinkExt, StreamExt};
use infrastructure::{Infrastructure, LOBBY_ROOM_ID};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;
use web_api::{router, AppState};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

pub fn lobby() -> Uuid {
    LOBBY_ROOM_ID
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    /// 使用内存后端在随机端口启动路由
    pub async fn spawn(config: AppConfig) -> Self {
        let infra = Infrastructure::in_memory(&config);
        let state = AppState::assemble(&infra, &config);
        let app = router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
        }
    }

    pub async fn dev() -> Self {
        Self::spawn(AppConfig::default()).await
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/api/v1/ws?{}", self.addr, query)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsClient {
    stream: WsStream,
    pub user_id: Uuid,
    pub username: String,
    pub session_id: Uuid,
}

impl WsClient {
    /// 开发模式握手，返回时已收到 `session:ready`
    pub async fn connect(server: &TestServer, username: &str) -> Self {
        Self::connect_as(server, Uuid::new_v4(), username).await
    }

    pub async fn connect_as(server: &TestServer, user_id: Uuid, username: &str) -> Self {
        let url = server.ws_url(&format!("user_id={user_id}&username={username}"));
        let (stream, _) = connect_async(url.as_str()).await.expect("ws connect");
        let mut client = Self {
            stream,
            user_id,
            username: username.to_string(),
            session_id: Uuid::nil(),
        };
        let ready = client.wait_for("session:ready").await;
        client.session_id = ready["sessionId"]
            .as_str()
            .and_then(|id| id.parse().ok())
            .expect("session id");
        client
    }

    pub async fn send(&mut self, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data }).to_string();
        self.stream
            .send(TungsteniteMessage::Text(frame.into()))
            .await
            .expect("ws send");
    }

    pub async fn join(&mut self, room_id: Uuid) {
        self.join_resuming(room_id, None).await;
    }

    pub async fn join_resuming(&mut self, room_id: Uuid, resume: Option<Uuid>) {
        let data = json!({
            "roomId": room_id,
            "userId": self.user_id,
            "username": self.username,
            "resumeSession": resume,
        });
        self.send("room:join", data).await;
    }

    pub async fn say(&mut self, room_id: Uuid, message: &str) {
        let data = json!({
            "roomId": room_id,
            "userId": self.user_id,
            "username": self.username,
            "message": message,
        });
        self.send("chat:message", data).await;
    }

    /// 下一条事件，超时返回 None
    pub async fn next_event(&mut self) -> Option<Value> {
        loop {
            let frame = tokio::time::timeout(EVENT_TIMEOUT, self.stream.next())
                .await
                .ok()??
                .ok()?;
            if let TungsteniteMessage::Text(text) = frame {
                return serde_json::from_str(text.as_str()).ok();
            }
        }
    }

    /// 跳过其他事件，返回指定事件的 data
    pub async fn wait_for(&mut self, event: &str) -> Value {
        while let Some(frame) = self.next_event().await {
            if frame["event"] == event {
                return frame["data"].clone();
            }
        }
        panic!("timed out waiting for `{event}`");
    }

    /// 等待文本匹配的 `chat:message`
    pub async fn wait_for_text(&mut self, text: &str) -> Value {
        loop {
            let data = self.wait_for("chat:message").await;
            if data["message"] == text {
                return data;
            }
        }
    }

    /// 等待文本匹配的 `system:message`
    pub async fn wait_for_notice(&mut self, text: &str) -> Value {
        loop {
            let data = self.wait_for("system:message").await;
            if data["message"] == text {
                return data;
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
