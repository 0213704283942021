//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use parley_cache::{CacheConfig, CacheService, MemoryStore};
use parley_server::{AppState, ConnectionRegistry, EchoEngine, Server, ServerConfig};

/// How long to wait for any single frame.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// A test server that runs in the background.
pub struct TestServer {
    /// The server's address.
    pub addr: SocketAddr,
    /// HTTP client for this server.
    pub client: Client,
    /// Cache service behind the server.
    pub cache: Arc<CacheService>,
    /// Live connection registry.
    pub registry: Arc<ConnectionRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Start a test server with rate limiting and request logging off.
    pub async fn start() -> Result<Self> {
        Self::start_with_config(
            ServerConfig::new()
                .with_rate_limiting(false)
                .with_request_logging(false),
        )
        .await
    }

    /// Start a test server with the given configuration.
    pub async fn start_with_config(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let cache = Arc::new(CacheService::new(
            Arc::new(MemoryStore::new()),
            CacheConfig::default(),
        ));
        let state = AppState::new(config.with_bind_address(addr), cache.clone(), Arc::new(EchoEngine));
        let registry = state.registry.clone();

        let (tx, rx) = oneshot::channel::<()>();
        let server = Server::from_state(state);
        let handle = tokio::spawn(async move {
            let _ = server
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await;
        });

        let client = Client::new();
        wait_for_server(&client, addr).await?;

        Ok(Self {
            addr,
            client,
            cache,
            registry,
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    /// Get the base URL for the server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// WebSocket URL for `path`.
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// GET a JSON document.
    pub async fn get_json(&self, path: &str) -> Result<(reqwest::StatusCode, Value)> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url(), path))
            .send()
            .await?;
        let status = resp.status();
        Ok((status, resp.json().await?))
    }

    /// Open a WebSocket and consume the `connection_established` frame.
    pub async fn connect(&self, path: &str) -> Result<WsClient> {
        let mut client = WsClient::connect(&self.ws_url(path)).await?;
        let hello = client.recv().await?;
        anyhow::ensure!(
            hello["type"] == "connection_established",
            "unexpected first frame: {hello}"
        );
        client.session_id = hello["data"]["session_id"]
            .as_str()
            .context("missing session_id")?
            .to_string();
        Ok(client)
    }

    /// Stop the server and wait for it to exit.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            timeout(Duration::from_secs(5), handle).await??;
        }
        Ok(())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Minimal JSON WebSocket client.
pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Session assigned by the server.
    pub session_id: String,
}

impl WsClient {
    async fn connect(url: &str) -> Result<Self> {
        let (stream, _) = connect_async(url).await?;
        Ok(Self {
            stream,
            session_id: String::new(),
        })
    }

    /// Send a JSON frame.
    pub async fn send(&mut self, frame: Value) -> Result<()> {
        self.stream.send(Message::Text(frame.to_string().into())).await?;
        Ok(())
    }

    /// Send a raw text frame.
    pub async fn send_raw(&mut self, text: &str) -> Result<()> {
        self.stream.send(Message::Text(text.to_string().into())).await?;
        Ok(())
    }

    /// Receive the next JSON frame, skipping control frames.
    pub async fn recv(&mut self) -> Result<Value> {
        loop {
            let msg = timeout(FRAME_TIMEOUT, self.stream.next())
                .await
                .context("timed out waiting for frame")?
                .context("stream closed")??;
            match msg {
                Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
                Message::Close(_) => anyhow::bail!("connection closed"),
                _ => continue,
            }
        }
    }

    /// Receive frames up to and including one of type `kind`.
    pub async fn recv_until(&mut self, kind: &str) -> Result<Vec<Value>> {
        let mut frames = Vec::new();
        loop {
            let frame = self.recv().await?;
            let done = frame["type"] == kind;
            frames.push(frame);
            if done {
                return Ok(frames);
            }
        }
    }

    /// Close the socket.
    pub async fn close(mut self) -> Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}

/// Wait for the server to become ready.
async fn wait_for_server(client: &Client, addr: SocketAddr) -> Result<()> {
    let url = format!("http://{}/health", addr);

    let result = timeout(Duration::from_secs(5), async {
        loop {
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return,
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(_) => anyhow::bail!("Timeout waiting for server to start"),
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> Result<()> {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("condition not met in time")
}
