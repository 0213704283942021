//! Start command - launches the Parley server.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Args;

use parley_cache::{CacheService, KvStore, MemoryStore, PerformanceTtls, RateLimitDefaults};
use parley_config::{ParleyConfig, StoreBackend, StoreConfig};
use parley_server::{EchoEngine, Server, ServerConfig};

use super::Context;

/// Arguments for the start command.
///
/// CLI arguments override config file values.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind to (overrides config)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Config file to use instead of discovery
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Redis URL; selects the Redis store (overrides config)
    #[arg(long, env = "PARLEY_REDIS_URL")]
    pub redis_url: Option<String>,
}

/// Run the start command.
pub async fn run(args: StartArgs, ctx: &Context) -> Result<()> {
    let mut config = load(args.config.as_deref())?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    let server_config = server_config(&config)?;
    let store = build_store(&config.store()).await?;
    let cache = Arc::new(CacheService::new(store, cache_config(&config)));

    if ctx.verbose {
        tracing::debug!(config = ?config.resolved(), "Resolved configuration");
    }
    tracing::info!(
        bind = %server_config.bind_address,
        store = %config.store().backend,
        "Starting Parley"
    );

    Server::new(server_config, cache, Arc::new(EchoEngine))
        .run()
        .await?;
    Ok(())
}

/// Load the config file at `path`, or discover and merge the config layers.
pub fn load(path: Option<&Path>) -> Result<ParleyConfig> {
    if let Some(path) = path {
        return Ok(parley_config::load_config_file(path)?);
    }

    let loaded = parley_config::load_config(None)?;
    for warning in &loaded.warnings {
        tracing::warn!("{}", warning);
    }
    for path in loaded.loaded_from() {
        tracing::debug!(path = %path.display(), "Loaded config file");
    }
    Ok(loaded.config)
}

fn apply_overrides(config: &mut ParleyConfig, args: &StartArgs) {
    let mut server = config.server();
    if let Some(port) = args.port {
        server.port = port;
    }
    if let Some(bind) = &args.bind {
        server.bind = bind.clone();
    }
    config.server = Some(server);

    if let Some(url) = &args.redis_url {
        config.store = Some(StoreConfig {
            backend: StoreBackend::Redis,
            url: Some(url.clone()),
        });
    }
}

fn secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

fn server_config(config: &ParleyConfig) -> Result<ServerConfig> {
    let server = config.server();
    let ip: IpAddr = server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", server.bind))?;

    Ok(ServerConfig::new()
        .with_bind_address(SocketAddr::new(ip, server.port))
        .with_rate_limiting(server.rate_limiting)
        .with_request_logging(server.request_logging)
        .with_max_ws_message_size(server.max_ws_message_size)
        .with_ws_connections_per_minute(server.ws_connections_per_minute)
        .with_idle_timeout(server.idle_timeout())
        .with_ws_write_timeout(server.ws_write_timeout()))
}

fn cache_config(config: &ParleyConfig) -> parley_cache::CacheConfig {
    let cache = config.cache();
    let limits = config.rate_limit();

    parley_cache::CacheConfig::new()
        .with_session_ttl(secs(cache.session_ttl_secs))
        .with_performance_ttls(PerformanceTtls {
            agent_response: secs(cache.agent_response_ttl_secs),
            product_info: secs(cache.product_info_ttl_secs),
            search_result: secs(cache.search_result_ttl_secs),
            embedding: secs(cache.embedding_ttl_secs),
        })
        .with_rate_limits(RateLimitDefaults {
            ip_max_requests: limits.ip_max_requests,
            ip_window: secs(limits.ip_window_secs),
            user_max_requests: limits.user_max_requests,
            user_window: secs(limits.user_window_secs),
        })
        .with_cleanup_task(cache.cleanup_enabled)
        .with_cleanup_interval(secs(cache.cleanup_interval_secs))
        .with_max_cleanup_backoff(secs(cache.max_cleanup_backoff_secs))
}

async fn build_store(store: &StoreConfig) -> Result<Arc<dyn KvStore>> {
    match store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Redis => connect_redis(store.url.as_deref().unwrap_or_default()).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(url: &str) -> Result<Arc<dyn KvStore>> {
    let store = parley_cache::RedisStore::connect(url)
        .await
        .with_context(|| format!("failed to connect to Redis at {url}"))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_url: &str) -> Result<Arc<dyn KvStore>> {
    anyhow::bail!("this build has no Redis support; rebuild with `--features redis`")
}
