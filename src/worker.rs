//! # Event Worker Pool
//!
//! `worker_count` independent consumers of the `events` log (§4.5). Each
//! worker owns its own `AnomalyDetector` instance and its own read cursor;
//! cross-worker ordering is not guaranteed, matching the per-worker
//! statistical partitioning the anomaly detector already assumes.
//!
//! Cursor handling resolves the spec's open question on `"$"` semantics:
//! only the very first read per worker uses `"$"` (meaning "entries
//! appended from now on"); every subsequent read advances to the highest
//! `entry_id` observed in the previous batch, so a worker woken after a
//! burst never re-reads or silently skips entries the way a literal
//! every-iteration `"$"` would.
//!
//! Shutdown follows the teacher's `processing.rs` skeleton: a shared
//! `running` flag plus a broadcast channel workers select against,
//! checked at the top of the loop so an in-flight batch always finishes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::anomaly::AnomalyDetector;
use crate::broadcast::BroadcastHub;
use crate::ingest::{EVENTS_STREAM, PROCESSED_CAP, PROCESSED_STREAM};
use crate::log_client::LogClient;
use crate::metrics::MetricsRegistry;
use crate::record;
use crate::retry::RetryScheduler;

const EMPTY_READ_BACKOFF: Duration = Duration::from_millis(100);
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Pool-wide configuration, mirroring spec §4.5.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    pub max_batch: usize,
    pub block_ms: u64,
}

/// Snapshot of worker pool activity for the `worker_stats` admin operation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStats {
    pub running: bool,
    pub worker_count: usize,
    pub processed_count: u64,
    pub failed_count: u64,
    pub anomaly_count: u64,
    pub success_rate: f64,
}

pub struct EventWorkerPool {
    log: Arc<dyn LogClient>,
    metrics: Arc<MetricsRegistry>,
    retry: Arc<RetryScheduler>,
    broadcast: Arc<BroadcastHub>,
    config: WorkerPoolConfig,

    running: Arc<AtomicBool>,
    shutdown_tx: RwLock<Option<broadcast::Sender<()>>>,
    handles: RwLock<Vec<JoinHandle<()>>>,

    processed_count: Arc<AtomicU64>,
    failed_count: Arc<AtomicU64>,
    anomaly_count: Arc<AtomicU64>,
}

impl EventWorkerPool {
    pub fn new(
        log: Arc<dyn LogClient>,
        metrics: Arc<MetricsRegistry>,
        retry: Arc<RetryScheduler>,
        broadcast: Arc<BroadcastHub>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            log,
            metrics,
            retry,
            broadcast,
            config,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: RwLock::new(None),
            handles: RwLock::new(Vec::new()),
            processed_count: Arc::new(AtomicU64::new(0)),
            failed_count: Arc::new(AtomicU64::new(0)),
            anomaly_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn `worker_count` worker tasks. No-op if already running.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("worker pool already running, ignoring start request");
            return;
        }

        let (tx, _) = broadcast::channel(1);
        *self.shutdown_tx.write().await = Some(tx.clone());

        let mut handles = Vec::with_capacity(self.config.worker_count);
        for worker_id in 0..self.config.worker_count {
            let worker = Worker {
                id: worker_id,
                log: self.log.clone(),
                metrics: self.metrics.clone(),
                retry: self.retry.clone(),
                broadcast: self.broadcast.clone(),
                max_batch: self.config.max_batch,
                block_ms: self.config.block_ms,
                processed_count: self.processed_count.clone(),
                failed_count: self.failed_count.clone(),
                anomaly_count: self.anomaly_count.clone(),
            };
            let mut shutdown_rx = tx.subscribe();
            handles.push(tokio::spawn(async move {
                worker.run(&mut shutdown_rx).await;
            }));
        }

        *self.handles.write().await = handles;
        info!(worker_count = self.config.worker_count, "worker pool started");
    }

    /// Clear the running flag and broadcast shutdown. In-flight workers
    /// finish their current batch before observing the signal (§5).
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }

        let handles = std::mem::take(&mut *self.handles.write().await);
        for handle in handles {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WorkerStats {
        let processed = self.processed_count.load(Ordering::Relaxed);
        let failed = self.failed_count.load(Ordering::Relaxed);
        let total = processed + failed;
        let success_rate = if total == 0 { 1.0 } else { processed as f64 / total as f64 };

        WorkerStats {
            running: self.is_running(),
            worker_count: self.config.worker_count,
            processed_count: processed,
            failed_count: failed,
            anomaly_count: self.anomaly_count.load(Ordering::Relaxed),
            success_rate,
        }
    }
}

struct Worker {
    id: usize,
    log: Arc<dyn LogClient>,
    metrics: Arc<MetricsRegistry>,
    retry: Arc<RetryScheduler>,
    broadcast: Arc<BroadcastHub>,
    max_batch: usize,
    block_ms: u64,
    processed_count: Arc<AtomicU64>,
    failed_count: Arc<AtomicU64>,
    anomaly_count: Arc<AtomicU64>,
}

impl Worker {
    async fn run(&self, shutdown_rx: &mut broadcast::Receiver<()>) {
        let mut detector = AnomalyDetector::default();
        let mut cursor = "$".to_string();

        info!(worker_id = self.id, "worker started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!(worker_id = self.id, "worker observed shutdown signal");
                    break;
                }
                result = self.log.read_tail(EVENTS_STREAM, &cursor, self.block_ms, self.max_batch) => {
                    match result {
                        Ok(entries) if entries.is_empty() => {
                            tokio::time::sleep(EMPTY_READ_BACKOFF).await;
                        }
                        Ok(entries) => {
                            if let Some((last_id, _)) = entries.last() {
                                cursor = last_id.clone();
                            }
                            for (entry_id, fields) in entries {
                                self.process_single(&mut detector, entry_id, fields).await;
                            }
                        }
                        Err(e) => {
                            error!(worker_id = self.id, error = %e, "read_tail failed, backing off");
                            tokio::time::sleep(READ_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }

    /// §4.5 `process_single`. Any failure from field validation through
    /// the `processed` append routes to the retry scheduler rather than
    /// propagating; the latency sample is always recorded regardless of
    /// outcome.
    async fn process_single(
        &self,
        detector: &mut AnomalyDetector,
        entry_id: String,
        fields: std::collections::HashMap<String, String>,
    ) {
        let start = Instant::now();

        let outcome = self.try_process(detector, &fields, start).await;
        let is_anomaly = matches!(&outcome, Ok((_, is_anomaly, _)) if *is_anomaly);
        self.metrics.record_processed(start.elapsed(), is_anomaly);

        match outcome {
            Ok((processed_entry_id, is_anomaly, z_score)) => {
                self.processed_count.fetch_add(1, Ordering::Relaxed);
                if is_anomaly {
                    self.anomaly_count.fetch_add(1, Ordering::Relaxed);
                    let value: f64 = fields.get("value").and_then(|s| s.parse().ok()).unwrap_or(0.0);
                    self.broadcast.notify_anomaly(&processed_entry_id, value, z_score, chrono::Utc::now());
                }
            }
            Err(error) => {
                self.failed_count.fetch_add(1, Ordering::Relaxed);
                warn!(worker_id = self.id, entry_id, error = %error, "processing failed, routing to retry");
                self.retry.handle_failure(entry_id, fields, error.to_string()).await;
            }
        }
    }

    async fn try_process(
        &self,
        detector: &mut AnomalyDetector,
        fields: &std::collections::HashMap<String, String>,
        start: Instant,
    ) -> crate::error::Result<(String, bool, f64)> {
        let enriched = record::fields::to_enriched(fields)?;
        let (is_anomaly, z_score) = detector.detect(enriched.value);

        let processing_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        let processed = enriched.into_processed(chrono::Utc::now(), self.id, is_anomaly, z_score, processing_time_ms);
        let map = record::fields::from_processed(&processed);

        let entry_id = self.log.append(PROCESSED_STREAM, &map, PROCESSED_CAP).await?;
        debug!(worker_id = self.id, entry_id, is_anomaly, z_score, "event processed");
        Ok((entry_id, is_anomaly, z_score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::log_client::InMemoryLogClient;
    use std::collections::HashMap;

    fn pool(max_batch: usize) -> (Arc<EventWorkerPool>, Arc<InMemoryLogClient>) {
        let log = InMemoryLogClient::new();
        let metrics = Arc::new(MetricsRegistry::new(&Config::default()).unwrap());
        let retry = Arc::new(RetryScheduler::new(log.clone(), metrics.clone(), &Config::default().retry));
        let hub = Arc::new(BroadcastHub::new(log.clone(), metrics.clone()));
        let config = WorkerPoolConfig {
            worker_count: 1,
            max_batch,
            block_ms: 50,
        };
        (
            Arc::new(EventWorkerPool::new(log.clone(), metrics, retry, hub, config)),
            log,
        )
    }

    fn event_fields(value: f64) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("timestamp".to_string(), "2024-01-30T10:45:00Z".to_string());
        fields.insert("type".to_string(), "t".to_string());
        fields.insert("value".to_string(), value.to_string());
        fields.insert("ingested_at".to_string(), chrono::Utc::now().to_rfc3339());
        fields.insert("processed".to_string(), "false".to_string());
        fields
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stats_report_running() {
        let (pool, _log) = pool(10);
        pool.start().await;
        pool.start().await;
        assert!(pool.stats().running);
        pool.stop().await;
        assert!(!pool.stats().running);
    }

    #[tokio::test]
    async fn processed_event_lands_in_processed_stream() {
        let (pool, log) = pool(10);
        log.append(EVENTS_STREAM, &event_fields(42.5), crate::ingest::EVENTS_CAP)
            .await
            .unwrap();

        pool.start().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        pool.stop().await;

        let info = log.stream_info(PROCESSED_STREAM).await.unwrap();
        assert_eq!(info.length, 1);
    }

    #[tokio::test]
    async fn malformed_entry_routes_to_retry_not_panic() {
        let (pool, log) = pool(10);
        let mut bad = event_fields(1.0);
        bad.remove("value");
        log.append(EVENTS_STREAM, &bad, crate::ingest::EVENTS_CAP).await.unwrap();

        pool.start().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        pool.stop().await;

        assert_eq!(pool.stats().failed_count, 1);
        let processed_info = log.stream_info(PROCESSED_STREAM).await.unwrap();
        assert_eq!(processed_info.length, 0);
    }

    #[tokio::test]
    async fn outlier_after_warmup_triggers_anomaly_and_broadcast() {
        let (pool, log) = pool(200);
        for _ in 0..50 {
            log.append(EVENTS_STREAM, &event_fields(10.0), crate::ingest::EVENTS_CAP)
                .await
                .unwrap();
        }
        log.append(EVENTS_STREAM, &event_fields(1000.0), crate::ingest::EVENTS_CAP)
            .await
            .unwrap();

        pool.start().await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        pool.stop().await;

        assert!(pool.stats().anomaly_count >= 1);
    }
}
