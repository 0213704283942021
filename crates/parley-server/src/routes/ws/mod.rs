//! WebSocket handler for real-time chat delivery.
//!
//! ## Module Structure
//!
//! - `protocol` - Wire envelope, error types and inbound validation
//! - `connection` - Socket lifecycle and the WebSocket transport
//! - `handlers` - Message processing logic

mod connection;
mod handlers;
mod protocol;

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, Query, State, ws::WebSocketUpgrade},
    http::{HeaderMap, header},
    response::Response,
};
use parley_cache::ClientInfo;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::Result;
use crate::ratelimit::check_ws_connect;
use crate::state::AppState;

pub use connection::WsTransport;
pub use handlers::{MessageOutcome, SessionMessageHandler};
pub use protocol::{
    ChatRequest, ClientRequest, Envelope, ErrorType, MessageType, ValidationError, parse_request,
};

/// Query parameters accepted on upgrade.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    /// User the connection belongs to.
    pub user_id: Option<String>,
}

/// GET /ws - WebSocket upgrade into a fresh session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let session_id = Uuid::new_v4().to_string();
    upgrade(ws, state, addr, session_id, query, &headers).await
}

/// GET /ws/{session_id} - WebSocket upgrade into an existing or named session.
pub async fn ws_session_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(session_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    upgrade(ws, state, addr, session_id, query, &headers).await
}

async fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    addr: SocketAddr,
    session_id: String,
    query: ConnectQuery,
    headers: &HeaderMap,
) -> Result<Response> {
    check_ws_connect(&state, addr).await?;

    let client_info = ClientInfo {
        device_info: None,
        ip_address: Some(addr.ip().to_string()),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    };
    let user_id = query.user_id.filter(|id| !id.trim().is_empty());

    Ok(ws
        .max_message_size(state.config.max_ws_message_size)
        .on_upgrade(move |socket| {
            connection::handle_socket(socket, state, session_id, user_id, client_info)
        }))
}
