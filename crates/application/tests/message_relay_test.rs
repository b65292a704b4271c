//! 消息中继集成测试：限流、长度校验、持久化降级、会话列表

mod support;

use std::time::Duration;

use application::{
    ApplicationError, DeleteMessageRequest, GetMessagesRequest, PresenceStore, RateLimitError,
    SendOutcome, ServerEvent,
};
use domain::{RewardReason, UserId};
use support::{chat_texts, notice_texts, Harness};
use uuid::Uuid;

#[tokio::test(start_paused = true)]
async fn sixth_message_in_flood_window_is_dropped() {
    let harness = Harness::new();
    let room = harness.add_room("Lobby", 5, UserId::from(Uuid::new_v4()));
    let mut bob = harness.connect("bob").await;
    let mut alice = harness.connect("alice").await;
    harness.join(&bob, &room).await.unwrap();
    harness.join(&alice, &room).await.unwrap();
    bob.drain();
    alice.drain();

    // 间隔 500ms 发送，避开全局冷却，六条消息都落在 3 秒窗口内
    for i in 0..5 {
        let outcome = harness.send(&alice, &room, &format!("msg {i}")).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Delivered(_)));
        tokio::time::advance(Duration::from_millis(500)).await;
    }
    let sixth = harness.send(&alice, &room, "msg 5").await.unwrap();
    assert!(matches!(
        sixth,
        SendOutcome::RateLimited(RateLimitError::FloodExceeded { .. })
    ));

    assert_eq!(harness.messages.stored().len(), 5);
    assert_eq!(chat_texts(&bob.drain()).len(), 5);
    let alice_events = alice.drain();
    assert_eq!(
        notice_texts(&alice_events),
        vec!["Lobby : Slow down! Wait a moment before sending another message."]
    );
    assert_eq!(harness.rewards.count(alice.user_id, RewardReason::SendMessage), 5);
}

#[tokio::test(start_paused = true)]
async fn global_cooldown_spans_rooms() {
    let harness = Harness::new();
    let owner = UserId::from(Uuid::new_v4());
    let lobby = harness.add_room("Lobby", 5, owner);
    let garden = harness.add_room("Garden", 5, owner);
    let mut alice = harness.connect("alice").await;
    harness.join(&alice, &lobby).await.unwrap();
    harness.join(&alice, &garden).await.unwrap();
    alice.drain();

    harness.send(&alice, &lobby, "first").await.unwrap();
    tokio::time::advance(Duration::from_millis(100)).await;
    let second = harness.send(&alice, &garden, "second").await.unwrap();

    assert!(matches!(
        second,
        SendOutcome::RateLimited(RateLimitError::CooldownActive { .. })
    ));
    let notices = notice_texts(&alice.drain());
    assert_eq!(notices, vec!["Please wait 400ms before sending another message."]);
}

#[tokio::test]
async fn exactly_max_length_is_accepted_one_more_is_not() {
    let harness = Harness::new();
    let room = harness.add_room("Lobby", 5, UserId::from(Uuid::new_v4()));
    let mut bob = harness.connect("bob").await;
    let alice = harness.connect("alice").await;
    harness.join(&bob, &room).await.unwrap();
    harness.join(&alice, &room).await.unwrap();
    bob.drain();

    let err = harness
        .send(&alice, &room, &"a".repeat(1001))
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Validation(_)));
    assert!(harness.messages.stored().is_empty());
    assert!(bob.drain().is_empty());

    let ok = harness.send(&alice, &room, &"a".repeat(1000)).await.unwrap();
    assert!(matches!(ok, SendOutcome::Delivered(_)));
    assert_eq!(harness.messages.stored().len(), 1);
}

#[tokio::test]
async fn persistence_failure_degrades_to_live_delivery() {
    let harness = Harness::new();
    let room = harness.add_room("Lobby", 5, UserId::from(Uuid::new_v4()));
    let mut bob = harness.connect("bob").await;
    let alice = harness.connect("alice").await;
    harness.join(&bob, &room).await.unwrap();
    harness.join(&alice, &room).await.unwrap();
    bob.drain();
    harness.messages.fail_inserts(true);

    let outcome = harness.send(&alice, &room, "still here").await.unwrap();
    let SendOutcome::Delivered(message) = outcome else {
        panic!("expected delivery");
    };

    let events = bob.drain();
    let delivered = events
        .iter()
        .find_map(|event| match event {
            ServerEvent::ChatMessage(m) => Some(m.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(delivered.id, message.id);
    assert!(harness.messages.stored().is_empty());
}

#[tokio::test]
async fn members_get_chat_list_updates() {
    let harness = Harness::new();
    let room = harness.add_room("Lobby", 5, UserId::from(Uuid::new_v4()));
    let mut bob = harness.connect("bob").await;
    let alice = harness.connect("alice").await;
    harness.join(&bob, &room).await.unwrap();
    harness.join(&alice, &room).await.unwrap();
    bob.drain();

    harness.send(&alice, &room, "hi bob").await.unwrap();

    let events = bob.drain();
    assert!(events
        .iter()
        .any(|event| matches!(event, ServerEvent::ChatListUpdate { room_id } if *room_id == room.id)));

    let ServerEvent::ChatList { rooms } = harness.relay.chat_list(&bob.username).await.unwrap()
    else {
        panic!("expected chat list");
    };
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].room_name, "Lobby");
    assert_eq!(rooms[0].user_count, 2);
    assert_eq!(rooms[0].last_message.as_ref().unwrap().message, "hi bob");
}

#[tokio::test]
async fn sending_to_a_room_not_joined_is_forbidden() {
    let harness = Harness::new();
    let room = harness.add_room("Lobby", 5, UserId::from(Uuid::new_v4()));
    let alice = harness.connect("alice").await;

    let err = harness.send(&alice, &room, "hello?").await.unwrap_err();
    assert!(matches!(err, ApplicationError::Forbidden(_)));
    assert_eq!(harness.presence.population(room.id).await.unwrap(), 0);
}

#[tokio::test]
async fn admin_deletes_message_and_room_is_notified() {
    let harness = Harness::new();
    let owner_id = UserId::from(Uuid::new_v4());
    let room = harness.add_room("Lobby", 5, owner_id);
    let mut owner = harness.connect_as("carol", owner_id).await;
    let alice = harness.connect("alice").await;
    harness.join(&owner, &room).await.unwrap();
    harness.join(&alice, &room).await.unwrap();

    let SendOutcome::Delivered(message) = harness.send(&alice, &room, "oops").await.unwrap() else {
        panic!("expected delivery");
    };
    owner.drain();

    let forbidden = harness
        .relay
        .delete_message(DeleteMessageRequest {
            session_id: alice.session_id,
            room_id: room.id.into(),
            message_id: message.id.into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(forbidden, ApplicationError::Forbidden(_)));

    harness
        .relay
        .delete_message(DeleteMessageRequest {
            session_id: owner.session_id,
            room_id: room.id.into(),
            message_id: message.id.into(),
        })
        .await
        .unwrap();

    let events = owner.drain();
    assert!(events
        .iter()
        .any(|event| matches!(event, ServerEvent::MessageDeleted { message_id, .. } if *message_id == message.id)));
    assert!(harness.messages.stored().is_empty());
}

#[tokio::test(start_paused = true)]
async fn history_pages_report_has_more_by_count() {
    let harness = Harness::new();
    let room = harness.add_room("Lobby", 5, UserId::from(Uuid::new_v4()));
    let alice = harness.connect("alice").await;
    harness.join(&alice, &room).await.unwrap();
    for i in 0..4 {
        harness.send(&alice, &room, &format!("m{i}")).await.unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
    }

    let page = harness
        .relay
        .get_messages(GetMessagesRequest {
            room_id: room.id.into(),
            limit: Some(2),
            offset: None,
        })
        .await
        .unwrap();
    assert!(page.has_more);
    assert_eq!(page.messages[0].message, "m3");

    let tail = harness
        .relay
        .get_messages(GetMessagesRequest {
            room_id: room.id.into(),
            limit: Some(2),
            offset: Some(3),
        })
        .await
        .unwrap();
    assert!(!tail.has_more);
    assert_eq!(tail.messages.len(), 1);
}
