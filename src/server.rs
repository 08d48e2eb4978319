//! # Pipeline Service
//!
//! Root composition object for the event processing core. Wires the log
//! client, metrics registry, ingestor, worker pool, retry scheduler, and
//! broadcast hub into one struct created at startup and torn down on
//! shutdown (§9's "clean re-architecture" design note: no module-scoped
//! singletons, admin/ingest handlers receive `State<PipelineService>`
//! rather than reaching for globals).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    routing::{get, post},
    Router,
};
use tokio::signal;
use tokio::sync::{broadcast, RwLock};
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::{debug, error, info};

use crate::broadcast::BroadcastHub;
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::handlers;
use crate::ingest::StreamIngestor;
use crate::log_client::{LogClient, RedisLogClient};
use crate::metrics::MetricsRegistry;
use crate::retry::RetryScheduler;
use crate::types::{ComponentHealth, HealthStatus};
use crate::worker::{EventWorkerPool, WorkerPoolConfig};

/// Composition root: everything §4's components need, assembled once.
#[derive(Clone)]
pub struct PipelineService {
    pub(crate) config: Arc<Config>,
    pub(crate) log: Arc<dyn LogClient>,
    pub(crate) metrics: Arc<MetricsRegistry>,
    pub(crate) ingestor: Arc<StreamIngestor>,
    pub(crate) worker_pool: Arc<EventWorkerPool>,
    pub(crate) retry: Arc<RetryScheduler>,
    pub(crate) broadcast: Arc<BroadcastHub>,
    started_at: Instant,
    shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    health_status: Arc<RwLock<HealthStatus>>,
}

impl PipelineService {
    /// Build every component against a shared `LogClient` and start
    /// nothing yet; call `start()` to spawn workers and the broadcast loop.
    pub async fn new(config: Config) -> Result<Self> {
        info!("initializing pulsecore pipeline");

        config
            .validate()
            .map_err(|e| CoreError::configuration(e.to_string()))?;
        let config = Arc::new(config);

        let metrics = Arc::new(MetricsRegistry::new(&config)?);
        let log: Arc<dyn LogClient> = Arc::new(RedisLogClient::new(&config.redis).await?);

        let ingestor = Arc::new(StreamIngestor::new(
            log.clone(),
            metrics.clone(),
            config.processing.max_batch_size,
        ));
        let retry = Arc::new(RetryScheduler::new(log.clone(), metrics.clone(), &config.retry));
        let broadcast = Arc::new(BroadcastHub::new(log.clone(), metrics.clone()));
        let worker_pool = Arc::new(EventWorkerPool::new(
            log.clone(),
            metrics.clone(),
            retry.clone(),
            broadcast.clone(),
            WorkerPoolConfig {
                worker_count: config.processing.worker_count,
                max_batch: config.processing.max_batch_size,
                block_ms: config.processing.block_ms,
            },
        ));

        Ok(Self {
            config,
            log,
            metrics,
            ingestor,
            worker_pool,
            retry,
            broadcast,
            started_at: Instant::now(),
            shutdown_tx: Arc::new(RwLock::new(None)),
            health_status: Arc::new(RwLock::new(HealthStatus::Healthy)),
        })
    }

    /// Start the worker pool, the broadcast loop, and the HTTP/WS server.
    /// Runs until a shutdown signal arrives.
    pub async fn start(&self) -> Result<()> {
        info!("starting pulsecore pipeline");
        *self.health_status.write().await = HealthStatus::Healthy;

        let (shutdown_tx, _) = broadcast::channel(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx.clone());

        self.worker_pool.start().await;
        self.broadcast.clone().spawn_broadcast_loop(shutdown_tx.subscribe());

        self.start_http_server(shutdown_tx.subscribe()).await
    }

    /// Stop the worker pool and broadcast loop. In-flight batches finish
    /// before workers observe the signal (§5).
    pub async fn stop(&self) -> Result<()> {
        info!("stopping pulsecore pipeline");
        *self.health_status.write().await = HealthStatus::Unhealthy;

        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
        self.worker_pool.stop().await;

        info!("pulsecore pipeline stopped");
        Ok(())
    }

    pub fn create_router(&self) -> Router {
        Router::new()
            .route("/health", get(handlers::health))
            .route("/health/ready", get(handlers::readiness))
            .route("/health/live", get(handlers::liveness))
            .route("/metrics", get(handlers::prometheus_metrics))
            .route("/ingest", post(handlers::ingest_batch))
            .route("/ingest/single", post(handlers::ingest_single))
            .route("/api/metrics", get(handlers::metrics_summary))
            .route("/api/worker/stats", get(handlers::worker_stats))
            .route("/api/dlq", get(handlers::list_dlq))
            .route("/api/dlq/:entry_id/retry", post(handlers::retry_dlq))
            .route("/api/streams/info", get(handlers::stream_info))
            .route("/ws", get(handlers::websocket_upgrade))
            .with_state(self.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CompressionLayer::new())
                    .layer(TimeoutLayer::new(Duration::from_secs(
                        self.config.server.request_timeout_seconds,
                    )))
                    .layer(CorsLayer::permissive()),
            )
    }

    async fn start_http_server(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.server.port));
        let router = self.create_router();

        info!(%addr, "starting HTTP/WS server");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| CoreError::internal(format!("failed to bind to {addr}: {e}")))?;

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_rx.recv().await.ok();
                debug!("HTTP server observed shutdown signal");
            })
            .await
            .map_err(|e| CoreError::internal(format!("server error: {e}")))
    }

    /// Aggregate health across every component (§6 health reporting).
    pub async fn health(&self) -> serde_json::Value {
        let overall = *self.health_status.read().await;
        let components = vec![self.log.health_check().await, self.check_worker_health()];

        serde_json::json!({
            "status": overall,
            "service": crate::SERVICE_NAME,
            "version": crate::VERSION,
            "components": components,
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "timestamp": chrono::Utc::now(),
        })
    }

    fn check_worker_health(&self) -> ComponentHealth {
        if self.worker_pool.is_running() {
            ComponentHealth::healthy("worker_pool", 0)
        } else {
            ComponentHealth::unhealthy("worker_pool", "pool not running")
        }
    }

    /// Wait for Ctrl+C or SIGTERM, used by `main.rs` to drive graceful
    /// shutdown of the whole service, not just the HTTP listener.
    pub async fn shutdown_signal() {
        let ctrl_c = async {
            signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C signal"),
            _ = terminate => info!("received SIGTERM signal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.port = 0;
        config
    }

    #[tokio::test]
    async fn new_fails_fast_on_invalid_config() {
        let mut config = test_config();
        config.processing.worker_count = 0;
        let result = PipelineService::new(config).await;
        assert!(matches!(result, Err(CoreError::Configuration { .. })));
    }
}
