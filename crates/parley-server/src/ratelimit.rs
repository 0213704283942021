//! Connection rate limiting and request logging middleware.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::config::WS_CONNECT_LIMIT;
use crate::error::{Result, ServerError};
use crate::state::AppState;

/// Window for WebSocket upgrade counters.
const WS_CONNECT_WINDOW: Duration = Duration::from_secs(60);

/// Count one WebSocket upgrade from `addr` against the per-IP limit.
///
/// Returns [`ServerError::RateLimitExceeded`] once the limit for the current
/// window is used up. A no-op when rate limiting is disabled.
pub async fn check_ws_connect(state: &AppState, addr: SocketAddr) -> Result<()> {
    if !state.config.rate_limiting {
        return Ok(());
    }

    let ip = addr.ip().to_string();
    let result = state
        .cache
        .rate_limits()
        .check_rate_limit(
            &ip,
            WS_CONNECT_LIMIT,
            u64::from(state.config.ws_connections_per_minute),
            WS_CONNECT_WINDOW,
        )
        .await;

    if result.allowed {
        return Ok(());
    }

    tracing::warn!(
        remote_ip = %ip,
        count = result.current_count,
        retry_after_seconds = result.reset_time,
        "WebSocket connection rate limit exceeded"
    );
    Err(ServerError::RateLimitExceeded {
        retry_after: result.reset_time,
    })
}

/// Structured request logging middleware.
///
/// Logs request details including method, path, status, and duration.
pub async fn request_logging_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.config.request_logging {
        return next.run(request).await;
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let start = std::time::Instant::now();
    let response = next.run(request).await;
    let duration = start.elapsed();
    let status = response.status();

    if status.is_server_error() {
        tracing::error!(
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "Request completed with server error"
        );
    } else if status.is_client_error() {
        tracing::warn!(
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "Request completed with client error"
        );
    } else {
        tracing::info!(
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "Request completed"
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::state::testing::test_state;
    use axum::{
        Router,
        http::{Request, StatusCode},
        middleware,
        routing::get,
    };
    use tower::ServiceExt;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 40000))
    }

    #[tokio::test]
    async fn test_ws_connect_limit_per_ip() {
        let state = test_state(ServerConfig::new().with_ws_connections_per_minute(2));

        check_ws_connect(&state, addr(1)).await.unwrap();
        check_ws_connect(&state, addr(1)).await.unwrap();
        let err = check_ws_connect(&state, addr(1)).await.unwrap_err();
        assert!(matches!(err, ServerError::RateLimitExceeded { retry_after } if retry_after <= 60));

        // Other addresses have their own counter.
        check_ws_connect(&state, addr(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_ws_connect_limit_disabled() {
        let state = test_state(
            ServerConfig::new()
                .with_rate_limiting(false)
                .with_ws_connections_per_minute(1),
        );
        for _ in 0..5 {
            check_ws_connect(&state, addr(1)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_request_logging_passes_through() {
        let state = test_state(ServerConfig::new());
        let app = Router::new()
            .route("/test", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                request_logging_middleware,
            ))
            .with_state(state);

        let response = app
            .oneshot(Request::builder().uri("/test").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
