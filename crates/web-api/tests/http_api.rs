mod support;

use config::AppConfig;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use uuid::Uuid;
use web_api::JwtService;

use support::{lobby, TestServer};

const SECRET: &str = "integration-test-secret-0123456789abcdef";

#[tokio::test]
async fn health_check() {
    let server = TestServer::dev().await;
    let response = reqwest::get(server.http("/health")).await.expect("health");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn status_round_trip_hides_invisible() {
    let server = TestServer::dev().await;
    let client = Client::new();
    let url = server.http("/api/v1/users/alice/status");

    let initial: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(initial["status"], "offline");

    let response = client
        .put(&url)
        .json(&json!({ "status": "busy" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let current: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(current["status"], "busy");

    client
        .put(&url)
        .json(&json!({ "status": "invisible" }))
        .send()
        .await
        .unwrap();
    let hidden: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(hidden["status"], "offline");
}

#[tokio::test]
async fn unknown_room_presence_is_not_found() {
    let server = TestServer::dev().await;
    let response = reqwest::get(server.http(&format!("/api/v1/rooms/{}/presence", Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "NOT_FOUND");

    let empty: Value = reqwest::get(server.http(&format!("/api/v1/rooms/{}/presence", lobby())))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(empty["userCount"], 0);
    assert_eq!(empty["roomName"], "Lobby");
}

#[tokio::test]
async fn jwt_mode_requires_a_valid_token() {
    let mut config = AppConfig::default();
    config.jwt.secret = Some(SECRET.to_string());
    let server = TestServer::spawn(config).await;

    let user_id = Uuid::new_v4();
    let dev_style = server.ws_url(&format!("user_id={user_id}&username=alice"));
    assert!(connect_async(dev_style.as_str()).await.is_err());

    let token = JwtService::new(SECRET)
        .generate_token(user_id, "alice", chrono::Duration::minutes(5))
        .unwrap();
    let (_stream, response) = connect_async(server.ws_url(&format!("token={token}")).as_str())
        .await
        .expect("authorized connect");
    assert_eq!(response.status().as_u16(), 101);

    // 只能修改自己的状态
    let client = Client::new();
    let forbidden = client
        .put(server.http("/api/v1/users/bob/status"))
        .bearer_auth(&token)
        .json(&json!({ "status": "away" }))
        .send()
        .await
        .unwrap();
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let own = client
        .put(server.http("/api/v1/users/alice/status"))
        .bearer_auth(&token)
        .json(&json!({ "status": "away" }))
        .send()
        .await
        .unwrap();
    assert_eq!(own.status(), StatusCode::OK);
}
