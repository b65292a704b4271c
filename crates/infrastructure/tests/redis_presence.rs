use application::{AddOutcome, PresenceStore, RateLimiter};
use chrono::Utc;
use config::AppConfig;
use domain::{RoomId, UserId, UserStatus, Username};
use infrastructure::Infrastructure;
use testcontainers::runners::AsyncRunner;
use testcontainers::ImageExt;
use testcontainers_modules::redis::Redis;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires local docker daemon"]
async fn redis_presence_and_rate_limits() {
    // PEXPIRE NX 需要 Redis 7
    let node = Redis::default()
        .with_tag("7.2")
        .start()
        .await
        .expect("start redis");
    let port = node.get_host_port_ipv4(6379u16).await.expect("port");

    let mut config = AppConfig::default();
    config.redis.url = Some(format!("redis://127.0.0.1:{port}"));
    let infra = Infrastructure::connect(&config).await.expect("connect");
    let presence = infra.presence.clone();

    let room = RoomId::from(Uuid::new_v4());
    let alice = Username::parse("alice").unwrap();
    let bob = Username::parse("bob").unwrap();
    let carol = Username::parse("carol").unwrap();

    assert_eq!(
        presence.add_member(room, &alice, 2, Utc::now()).await.unwrap(),
        AddOutcome::Added { population: 1 }
    );
    assert_eq!(
        presence.add_member(room, &alice, 2, Utc::now()).await.unwrap(),
        AddOutcome::AlreadyPresent { population: 1 }
    );
    presence.add_member(room, &bob, 2, Utc::now()).await.unwrap();
    assert_eq!(
        presence.add_member(room, &carol, 2, Utc::now()).await.unwrap(),
        AddOutcome::Full { population: 2 }
    );
    assert!(!presence.is_member(room, &carol).await.unwrap());
    assert_eq!(presence.user_rooms(&alice).await.unwrap(), vec![room]);

    let removed = presence.remove_member(room, &alice).await.unwrap();
    assert!(removed.removed);
    assert!(!presence.remove_member(room, &alice).await.unwrap().removed);
    assert!(presence.user_rooms(&alice).await.unwrap().is_empty());

    assert_eq!(presence.status(&alice).await.unwrap(), UserStatus::Offline);
    presence.set_status(&alice, UserStatus::Busy).await.unwrap();
    assert_eq!(presence.status(&alice).await.unwrap(), UserStatus::Busy);

    let limiter = infra.rate_limiter.clone();
    for _ in 0..5 {
        assert!(limiter.check_flood(&alice).await.unwrap().is_allowed());
    }
    assert!(!limiter.check_flood(&alice).await.unwrap().is_allowed());

    let user_id = UserId::from(Uuid::new_v4());
    assert!(limiter.check_cooldown(user_id).await.unwrap().is_allowed());
    assert!(!limiter.check_cooldown(user_id).await.unwrap().is_allowed());
}
