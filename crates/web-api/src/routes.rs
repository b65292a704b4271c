use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use application::{GetMessagesRequest, RosterEntry};
use domain::{MessagePage, RoomId, UserStatus, Username};

use crate::{
    auth::{authenticate, WsAuthQuery},
    error::ApiError,
    state::AppState,
    ws_connection::WebSocketConnection,
};

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    status: UserStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    username: Username,
    status: UserStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceResponse {
    room_id: RoomId,
    room_name: String,
    max_users: u32,
    user_count: usize,
    users: Vec<RosterEntry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(websocket_upgrade))
        .route("/rooms/{room_id}/presence", get(room_presence))
        .route("/rooms/{room_id}/messages", get(get_history))
        .route(
            "/users/{username}/status",
            get(get_status).put(put_status),
        )
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn room_presence(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
) -> Result<Json<PresenceResponse>, ApiError> {
    let room = state.coordinator.room(RoomId::from(room_id)).await?;
    let users = state.coordinator.roster(room.id).await?;

    Ok(Json(PresenceResponse {
        room_id: room.id,
        room_name: room.name,
        max_users: room.max_users,
        user_count: users.len(),
        users,
    }))
}

async fn get_history(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<MessagePage>, ApiError> {
    let page = state
        .relay
        .get_messages(GetMessagesRequest {
            room_id,
            limit: query.limit,
            offset: query.offset,
        })
        .await?;

    Ok(Json(page))
}

async fn get_status(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let username = Username::parse(username).map_err(|err| ApiError::bad_request(err.to_string()))?;
    let status = state
        .presence
        .status(&username)
        .await
        .map_err(ApiError::from)?;

    // 隐身对外显示为离线
    Ok(Json(StatusResponse {
        username,
        status: status.visible(),
    }))
}

async fn put_status(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<StatusPayload>,
) -> Result<Json<StatusResponse>, ApiError> {
    let username = Username::parse(username).map_err(|err| ApiError::bad_request(err.to_string()))?;
    if let Some(jwt) = &state.jwt_service {
        let identity = jwt.identity_from_headers(&headers)?;
        if identity.username != username {
            return Err(ApiError::forbidden("cannot change another user's status"));
        }
    }

    state
        .coordinator
        .update_status(&username, payload.status)
        .await
        .map_err(ApiError::from)?;
    tracing::info!(username = %username, status = %payload.status, "用户状态已更新");

    Ok(Json(StatusResponse {
        username,
        status: payload.status,
    }))
}

async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let identity = authenticate(state.jwt_service.as_deref(), &query)?;

    Ok(ws.on_upgrade(move |socket| async move {
        match WebSocketConnection::open(state, identity).await {
            Ok((connection, outbox)) => connection.run(socket, outbox).await,
            Err(err) => {
                tracing::warn!(code = err.code(), error = err.message(), "WebSocket 会话建立失败");
            }
        }
    }))
}
