use crate::config::Config;
use crate::sfu::{CapabilityNegotiator, SessionRegistry, TransportManager};
use crate::ws::connections::ConnectionManager;
use std::sync::Arc;

/// Shared by every connection task
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub transports: Arc<TransportManager>,
    pub negotiator: CapabilityNegotiator,
}

impl AppState {
    /// Builds the state without a router; install one through the registry
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let connections = Arc::new(ConnectionManager::new(config.signaling.broadcast_timeout()));
        let transports = Arc::new(TransportManager::new(
            &config.webrtc,
            config.signaling.engine_timeout(),
        ));
        let negotiator = CapabilityNegotiator::new(registry.clone());

        Self {
            config: Arc::new(config),
            registry,
            connections,
            transports,
            negotiator,
        }
    }
}
