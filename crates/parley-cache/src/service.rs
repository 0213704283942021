//! Composition of the caches plus the background cleanup task.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::performance::{PerformanceCache, PerformanceStats};
use crate::ratelimit::RateLimitCache;
use crate::session::SessionCache;
use crate::store::KvStore;

/// Overall health of the cache layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Store reachable and every sub-cache probe passed.
    Healthy,
    /// Store reachable but at least one probe failed.
    Degraded,
    /// Store unreachable.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of [`CacheService::health_check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Backend name (`memory`, `redis`).
    pub backend: String,
    pub store: bool,
    pub sessions: bool,
    pub performance: bool,
    pub rate_limits: bool,
    pub cleanup_running: bool,
    pub checked_at: DateTime<Utc>,
}

/// Counters kept by the cleanup task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStats {
    /// Completed sweep passes.
    pub runs: u64,
    /// Passes that ended in an error.
    pub failures: u64,
    pub sessions_removed: u64,
    pub rate_limits_removed: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// What one sweep pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub sessions: usize,
    pub rate_limits: usize,
}

/// Result of [`CacheService::get_stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheServiceStats {
    /// `None` when the store could not be enumerated.
    pub performance: Option<PerformanceStats>,
    pub health: HealthReport,
    pub cleanup: CleanupStats,
}

struct CleanupTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// The sweeping half of the service, shared with the background task.
#[derive(Clone)]
struct Sweeper {
    sessions: SessionCache,
    rate_limits: RateLimitCache,
    stats: Arc<Mutex<CleanupStats>>,
}

impl Sweeper {
    async fn sweep_all(&self) -> Result<SweepReport> {
        Ok(SweepReport {
            sessions: self.sessions.sweep_expired().await?,
            rate_limits: self.rate_limits.sweep_expired().await?,
        })
    }

    async fn sweep(&self) -> Result<SweepReport> {
        let outcome = self.sweep_all().await;

        let mut stats = self.stats.lock();
        stats.runs += 1;
        stats.last_run = Some(Utc::now());
        match &outcome {
            Ok(report) => {
                stats.sessions_removed += report.sessions as u64;
                stats.rate_limits_removed += report.rate_limits as u64;
                stats.last_error = None;
            }
            Err(e) => {
                stats.failures += 1;
                stats.last_error = Some(e.to_string());
            }
        }
        outcome
    }

    /// Sweep every `interval` until cancelled. Failures double the delay up
    /// to `max_backoff`; a success restores the regular interval.
    async fn run(self, token: CancellationToken, interval: Duration, max_backoff: Duration) {
        let mut delay = interval;
        debug!(interval_secs = interval.as_secs(), "Cache cleanup task started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.sweep().await {
                Ok(report) => {
                    if report.sessions + report.rate_limits > 0 {
                        debug!(
                            sessions = report.sessions,
                            rate_limits = report.rate_limits,
                            "Cache cleanup pass removed entries"
                        );
                    }
                    delay = interval;
                }
                Err(e) => {
                    delay = delay.saturating_mul(2).min(max_backoff.max(interval));
                    warn!(
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "Cache cleanup pass failed"
                    );
                }
            }
        }

        debug!("Cache cleanup task stopped");
    }
}

/// Entry point to the cache layer.
///
/// Construct once at startup and share behind an `Arc`.
pub struct CacheService {
    store: CacheStore,
    sessions: SessionCache,
    performance: PerformanceCache,
    rate_limits: RateLimitCache,
    config: CacheConfig,
    sweeper: Sweeper,
    cleanup: Mutex<Option<CleanupTask>>,
}

impl CacheService {
    /// Build the caches over one shared backing store.
    pub fn new(backend: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        let store = CacheStore::new(backend);
        let sessions = SessionCache::new(store.clone(), config.session_ttl);
        let performance = PerformanceCache::new(store.clone(), &config.performance);
        let rate_limits = RateLimitCache::new(store.clone(), config.rate_limits.clone());
        let sweeper = Sweeper {
            sessions: sessions.clone(),
            rate_limits: rate_limits.clone(),
            stats: Arc::new(Mutex::new(CleanupStats::default())),
        };

        Self {
            store,
            sessions,
            performance,
            rate_limits,
            config,
            sweeper,
            cleanup: Mutex::new(None),
        }
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    pub fn performance(&self) -> &PerformanceCache {
        &self.performance
    }

    pub fn rate_limits(&self) -> &RateLimitCache {
        &self.rate_limits
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Check the store and start the cleanup task.
    ///
    /// Calling this again while the task is running is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        self.store.backend().ping().await?;

        if !self.config.enable_cleanup_task {
            info!(backend = self.store.backend().backend(), "Cache service initialized");
            return Ok(());
        }

        let mut cleanup = self.cleanup.lock();
        if cleanup.is_some() {
            return Ok(());
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(self.sweeper.clone().run(
            token.clone(),
            self.config.cleanup_interval,
            self.config.max_cleanup_backoff,
        ));
        *cleanup = Some(CleanupTask { token, handle });

        info!(
            backend = self.store.backend().backend(),
            cleanup_interval_secs = self.config.cleanup_interval.as_secs(),
            "Cache service initialized"
        );
        Ok(())
    }

    /// Stop the cleanup task and wait for it to exit.
    ///
    /// A sweep already in progress runs to completion first.
    pub async fn shutdown(&self) {
        let task = self.cleanup.lock().take();
        let Some(task) = task else {
            return;
        };

        task.token.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Cache cleanup task ended abnormally");
        }
        info!("Cache service stopped");
    }

    /// Whether the cleanup task is currently running.
    pub fn is_running(&self) -> bool {
        self.cleanup
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Run one sweep pass immediately.
    pub async fn run_cleanup_once(&self) -> Result<SweepReport> {
        self.sweeper.sweep().await
    }

    /// Probe the store and each sub-cache.
    pub async fn health_check(&self) -> HealthReport {
        let backend = self.store.backend();
        let store = match backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Cache store ping failed");
                false
            }
        };
        let sessions = self.sessions.probe().await;
        let performance = self.performance.probe().await;
        let rate_limits = self.rate_limits.probe().await;

        let status = if !store {
            HealthStatus::Unhealthy
        } else if sessions && performance && rate_limits {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            backend: backend.backend().to_string(),
            store,
            sessions,
            performance,
            rate_limits,
            cleanup_running: self.is_running(),
            checked_at: Utc::now(),
        }
    }

    /// Entry counts, health and cleanup counters.
    pub async fn get_stats(&self) -> CacheServiceStats {
        let performance = match self.performance.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Failed to collect performance cache stats");
                None
            }
        };

        CacheServiceStats {
            performance,
            health: self.health_check().await,
            cleanup: self.sweeper.stats.lock().clone(),
        }
    }
}

impl Drop for CacheService {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup.get_mut().take() {
            task.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ClientInfo;
    use crate::store::MemoryStore;

    fn create_service(config: CacheConfig) -> (Arc<MemoryStore>, CacheService) {
        let backend = Arc::new(MemoryStore::new());
        let service = CacheService::new(backend.clone(), config);
        (backend, service)
    }

    #[tokio::test]
    async fn test_initialize_and_shutdown() {
        let (_, service) = create_service(CacheConfig::default());

        service.initialize().await.unwrap();
        assert!(service.is_running());

        // Idempotent.
        service.initialize().await.unwrap();
        assert!(service.is_running());

        service.shutdown().await;
        assert!(!service.is_running());

        // Shutting down twice is harmless.
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialize_without_cleanup_task() {
        let (_, service) = create_service(CacheConfig::default().with_cleanup_task(false));
        service.initialize().await.unwrap();
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_initialize_fails_when_store_is_down() {
        let (backend, service) = create_service(CacheConfig::default());
        backend.set_offline(true);

        assert!(service.initialize().await.unwrap_err().is_unavailable());
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_run_cleanup_once_reports_counts() {
        let (backend, service) = create_service(CacheConfig::default());

        backend.set("session:stale", "{}").await.unwrap();
        backend.set("rate_limit:ip:stuck", "3").await.unwrap();
        service
            .sessions()
            .create(Some("u1"), ClientInfo::default())
            .await
            .unwrap();

        let report = service.run_cleanup_once().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                sessions: 1,
                rate_limits: 1
            }
        );

        let stats = service.get_stats().await;
        assert_eq!(stats.cleanup.runs, 1);
        assert_eq!(stats.cleanup.sessions_removed, 1);
        assert!(stats.cleanup.last_run.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_sweeps_on_interval() {
        let config = CacheConfig::default().with_cleanup_interval(Duration::from_secs(10));
        let (backend, service) = create_service(config);
        service.initialize().await.unwrap();

        backend.set("rate_limit:ip:stuck", "3").await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(backend.get("rate_limit:ip:stuck").await.unwrap().is_none());
        assert_eq!(service.get_stats().await.cleanup.rate_limits_removed, 1);

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_survives_store_outage() {
        let config = CacheConfig::default()
            .with_cleanup_interval(Duration::from_secs(10))
            .with_max_cleanup_backoff(Duration::from_secs(40));
        let (backend, service) = create_service(config);
        service.initialize().await.unwrap();

        backend.set_offline(true);
        // Passes at 10s, 30s (backoff 20s) and 70s (backoff 40s).
        tokio::time::sleep(Duration::from_secs(71)).await;

        let stats = service.get_stats().await.cleanup;
        assert_eq!(stats.failures, 3);
        assert!(stats.last_error.is_some());
        assert!(service.is_running());

        backend.set_offline(false);
        backend.set("rate_limit:ip:stuck", "3").await.unwrap();
        // Next pass after the capped 40s back-off.
        tokio::time::sleep(Duration::from_secs(40)).await;

        let stats = service.get_stats().await.cleanup;
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.rate_limits_removed, 1);
        assert!(stats.last_error.is_none());

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_check() {
        let (backend, service) = create_service(CacheConfig::default());

        let report = service.health_check().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.backend, "memory");
        assert!(report.store && report.sessions && report.performance && report.rate_limits);

        backend.set_offline(true);
        let report = service.health_check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.store);
    }

    #[tokio::test]
    async fn test_health_check_degraded_on_bad_probe_key() {
        let (backend, service) = create_service(CacheConfig::default());
        // A set under the probe key makes the rate limit probe read fail.
        backend
            .sadd_ex("rate_limit:probe:__health_probe__", "x", Duration::from_secs(60))
            .await
            .unwrap();

        let report = service.health_check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(!report.rate_limits);
        assert!(report.sessions);
    }

    #[tokio::test]
    async fn test_get_stats_with_store_down() {
        let (backend, service) = create_service(CacheConfig::default());
        service.performance().cache_embedding("e", vec![1.0]).await;

        let stats = service.get_stats().await;
        assert_eq!(stats.performance.unwrap().embeddings, 1);

        backend.set_offline(true);
        let stats = service.get_stats().await;
        assert!(stats.performance.is_none());
        assert_eq!(stats.health.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_health_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(HealthStatus::Healthy.to_string(), "healthy");
    }
}
