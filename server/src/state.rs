use std::sync::Arc;

use crate::auth::IdentityVerifier;
use crate::config::SessionConfig;
use crate::db::store::MessageStore;
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Resolves credentials to user identities
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Durable message log
    pub store: Arc<dyn MessageStore>,
    /// Live WebSocket connection per user
    pub connections: ConnectionRegistry,
    /// Per-connection session settings
    pub session: Arc<SessionConfig>,
}

impl AppState {
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        store: Arc<dyn MessageStore>,
        session: SessionConfig,
    ) -> Self {
        Self {
            verifier,
            store,
            connections: ConnectionRegistry::new(),
            session: Arc::new(session),
        }
    }
}
