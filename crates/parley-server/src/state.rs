//! Application state shared across handlers.

use std::sync::Arc;

use parley_cache::CacheService;

use crate::config::ServerConfig;
use crate::engine::ConversationEngine;
use crate::registry::ConnectionRegistry;
use crate::routes::ws::SessionMessageHandler;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,

    /// Live WebSocket connections.
    pub registry: Arc<ConnectionRegistry>,

    /// Session, performance and rate-limit caches.
    pub cache: Arc<CacheService>,

    /// Inbound frame router.
    pub handler: SessionMessageHandler,
}

impl AppState {
    /// Create a new application state.
    pub fn new(
        config: ServerConfig,
        cache: Arc<CacheService>,
        engine: Arc<dyn ConversationEngine>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let handler = SessionMessageHandler::new(
            Arc::clone(&registry),
            Arc::clone(&cache),
            engine,
            config.rate_limiting,
        );

        Self {
            config: Arc::new(config),
            registry,
            cache,
            handler,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
