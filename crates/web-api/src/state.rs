use std::sync::Arc;

use application::{
    CoordinatorSettings, LocalMessageBroadcaster, MessageRelay, MessageRelayDependencies,
    PresenceStore, RelaySettings, RoomCoordinator, RoomCoordinatorDependencies, SessionRegistry,
    SystemClock,
};
use config::AppConfig;
use infrastructure::Infrastructure;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RoomCoordinator>,
    pub relay: Arc<MessageRelay>,
    pub hub: Arc<LocalMessageBroadcaster>,
    pub presence: Arc<dyn PresenceStore>,
    /// 未配置密钥时为开发模式，直接信任查询参数中的身份
    pub jwt_service: Option<Arc<JwtService>>,
}

impl AppState {
    /// 用基础设施组装协调器、中继与连接中心
    pub fn assemble(infra: &Infrastructure, config: &AppConfig) -> Self {
        let hub = Arc::new(LocalMessageBroadcaster::new(
            config.relay.outbound_queue_capacity,
        ));
        let sessions = Arc::new(SessionRegistry::new());
        let clock = Arc::new(SystemClock);

        let coordinator = Arc::new(RoomCoordinator::new(RoomCoordinatorDependencies {
            presence: infra.presence.clone(),
            directory: infra.directory.clone(),
            bans: infra.bans.clone(),
            rewards: infra.rewards.clone(),
            broadcaster: hub.clone(),
            sessions: sessions.clone(),
            clock: clock.clone(),
            settings: CoordinatorSettings::from(&config.relay),
        }));
        let relay = Arc::new(MessageRelay::new(MessageRelayDependencies {
            presence: infra.presence.clone(),
            rate_limiter: infra.rate_limiter.clone(),
            messages: infra.messages.clone(),
            directory: infra.directory.clone(),
            rewards: infra.rewards.clone(),
            broadcaster: hub.clone(),
            sessions,
            clock,
            settings: RelaySettings::from(&config.relay),
        }));
        let jwt_service = config
            .jwt
            .secret
            .as_deref()
            .map(|secret| Arc::new(JwtService::new(secret)));

        Self {
            coordinator,
            relay,
            hub,
            presence: infra.presence.clone(),
            jwt_service,
        }
    }
}
