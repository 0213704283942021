//! WebSocket connection lifecycle.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{Sink, SinkExt, StreamExt};
use parley_cache::ClientInfo;
use tokio::sync::Mutex;

use super::protocol::{Envelope, ErrorType};
use crate::registry::{Transport, TransportError};
use crate::state::AppState;

/// Outbound half of an axum WebSocket.
///
/// Every write, including waiting for the sink lock, is bounded by
/// `write_timeout`.
pub struct WsTransport<S = SplitSink<WebSocket, Message>> {
    sink: Mutex<S>,
    write_timeout: Duration,
}

impl<S> WsTransport<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    pub fn new(sink: S, write_timeout: Duration) -> Self {
        Self {
            sink: Mutex::new(sink),
            write_timeout,
        }
    }

    /// Write a raw frame.
    async fn send_frame(&self, message: Message) -> Result<(), TransportError> {
        let write = async {
            self.sink
                .lock()
                .await
                .send(message)
                .await
                .map_err(|e| TransportError::Write(e.to_string()))
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Write(format!(
                "write timed out after {:?}",
                self.write_timeout
            ))),
        }
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.send_frame(Message::Text(text.into())).await
    }

    async fn close(&self) {
        let close = async {
            let _ = self.sink.lock().await.close().await;
        };
        let _ = tokio::time::timeout(self.write_timeout, close).await;
    }
}

/// Handle a WebSocket connection until the peer leaves, goes idle, or is
/// evicted from the registry.
pub async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    user_id: Option<String>,
    client_info: ClientInfo,
) {
    let (sender, mut receiver) = socket.split();
    let transport = Arc::new(WsTransport::new(sender, state.config.ws_write_timeout));
    let registry = Arc::clone(&state.registry);

    let connection_id = registry.connect(transport.clone(), session_id.as_str(), user_id, client_info);
    tracing::debug!(
        connection_id = %connection_id,
        session_id = %session_id,
        "WebSocket connection established"
    );

    let established = Envelope::connection_established(connection_id, &session_id);
    if !registry.send_personal(&established, connection_id).await {
        transport.close().await;
        return;
    }

    loop {
        let msg = match tokio::time::timeout(state.config.idle_timeout, receiver.next()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(_) => {
                tracing::info!(connection_id = %connection_id, "WebSocket connection closed due to idle timeout");
                let _ = registry
                    .try_send(
                        &Envelope::error(ErrorType::IdleTimeout, "Connection closed due to inactivity"),
                        connection_id,
                    )
                    .await;
                break;
            }
        };

        // Binary frames are accepted when they carry UTF-8 JSON.
        let text = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    registry
                        .send_personal(
                            &Envelope::error(ErrorType::InvalidMessage, "Binary data must be UTF-8"),
                            connection_id,
                        )
                        .await;
                    continue;
                }
            },
            Ok(Message::Ping(data)) => {
                let _ = transport.send_frame(Message::Pong(data)).await;
                continue;
            }
            Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!(connection_id = %connection_id, "WebSocket error: {}", e);
                break;
            }
        };

        state.handler.handle_message(connection_id, &text).await;

        // A failed send evicts the connection.
        if !registry.is_connected(connection_id) {
            break;
        }
    }

    registry.disconnect(connection_id);
    transport.close().await;

    tracing::debug!(connection_id = %connection_id, "WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// A sink whose peer never reads: it is never ready for another frame.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = std::io::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out() {
        let transport = WsTransport::new(StalledSink, Duration::from_secs(2));

        let err = transport.send_text("hello".to_string()).await.unwrap_err();
        assert!(matches!(err, TransportError::Write(_)));

        // Close gives up too instead of hanging.
        transport.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_is_evicted_from_fan_out() {
        let registry = ConnectionRegistry::new();
        let stalled = Arc::new(WsTransport::new(StalledSink, Duration::from_secs(2)));
        let id = registry.connect(stalled, "room", None, ClientInfo::default());

        let delivered = registry.send_to_session(&Envelope::pong(), "room").await;
        assert_eq!(delivered, 0);
        assert!(!registry.is_connected(id));
    }

    #[tokio::test]
    async fn test_ready_sink_delivers() {
        let (tx, mut rx) = futures::channel::mpsc::unbounded::<Message>();
        let transport = WsTransport::new(tx, Duration::from_secs(2));

        transport.send_text("hi".to_string()).await.unwrap();
        match rx.next().await {
            Some(Message::Text(text)) => assert_eq!(text.as_str(), "hi"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
