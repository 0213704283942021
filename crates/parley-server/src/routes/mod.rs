//! HTTP routes.

pub mod health;
pub mod ws;

pub use health::{HealthResponse, StatsResponse, health_routes};
pub use ws::{ws_handler, ws_session_handler};
