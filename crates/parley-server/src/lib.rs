//! WebSocket delivery server for Parley.
//!
//! This crate hosts live chat connections and routes their frames through
//! the session cache and a conversation engine.
//!
//! # Features
//!
//! - Connection registry with per-session and per-user fan-out
//! - Streaming chat replies over WebSocket
//! - Per-IP connection and per-user message rate limiting
//! - Health and stats endpoints
//! - Request logging
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use parley_cache::{CacheConfig, CacheService, MemoryStore};
//! use parley_server::{EchoEngine, Server, ServerConfig};
//!
//! let cache = Arc::new(CacheService::new(Arc::new(MemoryStore::new()), CacheConfig::default()));
//! let config = ServerConfig::new().with_bind_address("127.0.0.1:8080".parse()?);
//!
//! let server = Server::new(config, cache, Arc::new(EchoEngine));
//! server.run().await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod ratelimit;
pub mod registry;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use engine::{ConversationEngine, EchoEngine, EngineError, ResponseChunk, ResponseStream, User};
pub use error::{Result, ServerError};
pub use ratelimit::{check_ws_connect, request_logging_middleware};
pub use registry::{
    Connection, ConnectionId, ConnectionRegistry, RegistryStats, SendError, Transport,
    TransportError,
};
pub use routes::ws::{Envelope, ErrorType, MessageOutcome, MessageType, SessionMessageHandler};
pub use state::AppState;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, middleware};
use parley_cache::CacheService;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// The Parley HTTP/WebSocket server.
pub struct Server {
    /// Application state.
    state: AppState,
}

impl Server {
    /// Create a new server over a cache service and conversation engine.
    pub fn new(
        config: ServerConfig,
        cache: Arc<CacheService>,
        engine: Arc<dyn ConversationEngine>,
    ) -> Self {
        Self {
            state: AppState::new(config, cache, engine),
        }
    }

    /// Create a server from a pre-built application state.
    pub fn from_state(state: AppState) -> Self {
        Self { state }
    }

    /// Shared application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        use axum::routing::get;

        Router::new()
            .merge(routes::health_routes())
            .route("/ws", get(routes::ws_handler))
            .route("/ws/{session_id}", get(routes::ws_session_handler))
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                ratelimit::request_logging_middleware,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Run the server on the configured address until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let addr = self.state.config.bind_address;
        self.run_until(addr, shutdown_signal()).await
    }

    /// Run the server on a specific address until Ctrl-C.
    pub async fn run_on(self, addr: SocketAddr) -> Result<()> {
        self.run_until(addr, shutdown_signal()).await
    }

    /// Run the server on `addr` until `shutdown` resolves.
    pub async fn run_until<F>(self, addr: SocketAddr, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Internal(format!("Failed to bind: {}", e)))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    ///
    /// Starts the cache service first and stops it after the last request.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.state.cache.initialize().await?;

        let router = self.router();
        match listener.local_addr() {
            Ok(addr) => info!("Starting server on {}", addr),
            Err(_) => info!("Starting server"),
        }

        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        self.state.cache.shutdown().await;
        info!(
            open_connections = self.state.registry.len(),
            "Server stopped"
        );

        result.map_err(|e| ServerError::Internal(format!("Server error: {}", e)))
    }

    /// Get the configured bind address.
    pub fn bind_address(&self) -> SocketAddr {
        self.state.config.bind_address
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for Ctrl-C, running until killed");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::test_state;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_server_health_endpoint() {
        let server = Server::from_state(test_state(ServerConfig::new()));

        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let server = Server::from_state(test_state(ServerConfig::new()));

        let response = server
            .router()
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_starts_and_stops_cache() {
        let cache = Arc::new(CacheService::new(
            Arc::new(parley_cache::MemoryStore::new()),
            parley_cache::CacheConfig::default(),
        ));
        let server = Server::new(ServerConfig::new(), cache.clone(), Arc::new(EchoEngine));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(listener, async {
            let _ = rx.await;
        }));

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !cache.is_running() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!cache.is_running());
    }
}
