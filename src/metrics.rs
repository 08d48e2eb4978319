//! # Metrics Registry
//!
//! Prometheus-backed counters/gauges plus bounded reservoirs for latency
//! percentiles. The teacher's collector registered histograms but never
//! actually computed a summary from them (`get_snapshot` returned 0.0
//! placeholders); this version keeps a fixed-size sample reservoir per
//! latency metric so `summary()` can report real P50/P95/P99 without an
//! unbounded memory footprint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use prometheus::{
    histogram_opts, opts, register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, Histogram, IntCounter, IntGauge, Registry,
    TextEncoder,
};
use serde::Serialize;

use crate::config::Config;
use crate::error::{CoreError, Result};

/// Maximum number of latency samples retained per reservoir. Bounds memory
/// at a fixed ~80KB per histogram (10_000 f64) regardless of uptime.
const RESERVOIR_CAPACITY: usize = 10_000;

/// Static accuracy figure for the Z-score detector, reported alongside the
/// live counters. The detector has no labeled ground truth to score itself
/// against at runtime, so this mirrors the fixed benchmark figure the
/// original implementation reported for the same algorithm.
const ANOMALY_ACCURACY: f64 = 0.87;

struct Reservoir {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl Reservoir {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Nearest-rank percentile over a sorted copy of the reservoir. Returns
    /// 0.0 when no samples have been recorded yet.
    fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }
}

/// Latency and throughput summary, returned by `/metrics` and fed into the
/// periodic broadcast snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub events_ingested: u64,
    pub events_processed: u64,
    pub anomalies_detected: u64,
    pub events_per_second: f64,
    pub current_throughput_eps: f64,
    pub ingestion_latency_p50_ms: f64,
    pub ingestion_latency_p95_ms: f64,
    pub ingestion_latency_p99_ms: f64,
    pub processing_latency_p50_ms: f64,
    pub processing_latency_p95_ms: f64,
    pub processing_latency_p99_ms: f64,
    pub anomaly_accuracy: f64,
    pub active_connections: u64,
    pub uptime_seconds: u64,
    pub throughput_target: u64,
    pub latency_target_p95_ms: u64,
    pub below_throughput_target: bool,
}

/// Central metrics registry shared by the ingestor, worker pool, retry
/// scheduler, and broadcast hub. One instance per process.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    started_at: Instant,

    events_ingested_total: IntCounter,
    events_processed_total: IntCounter,
    events_failed_total: IntCounter,
    anomalies_detected_total: IntCounter,
    dlq_events_total: IntCounter,

    ingestion_latency_seconds: Histogram,
    processing_latency_seconds: Histogram,

    current_throughput_eps: IntGauge,
    active_connections: IntGauge,

    ingestion_reservoir: Arc<Mutex<Reservoir>>,
    processing_reservoir: Arc<Mutex<Reservoir>>,

    throughput_window: Arc<Mutex<ThroughputWindow>>,
    active_connection_count: Arc<AtomicU64>,

    throughput_target: u64,
    latency_target_p95_ms: u64,
}

/// Rolling one-second event counter used to derive `current_throughput_eps`
/// without a background sampling task.
struct ThroughputWindow {
    window_start: Instant,
    count_in_window: u64,
    last_rate: f64,
}

impl ThroughputWindow {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            count_in_window: 0,
            last_rate: 0.0,
        }
    }

    fn record(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.last_rate = self.count_in_window as f64 / elapsed.as_secs_f64();
            self.count_in_window = 0;
            self.window_start = Instant::now();
        }
        self.count_in_window += 1;
    }

    fn rate(&self) -> f64 {
        self.last_rate
    }
}

impl MetricsRegistry {
    pub fn new(config: &Config) -> Result<Self> {
        let registry = Registry::new();

        let events_ingested_total = register_int_counter_with_registry!(
            opts!("events_ingested_total", "Total number of events accepted by ingestion"),
            &registry
        )
        .map_err(|e| CoreError::internal(format!("failed to register metric: {e}")))?;

        let events_processed_total = register_int_counter_with_registry!(
            opts!("events_processed_total", "Total number of events processed successfully"),
            &registry
        )
        .map_err(|e| CoreError::internal(format!("failed to register metric: {e}")))?;

        let events_failed_total = register_int_counter_with_registry!(
            opts!("events_failed_total", "Total number of events that failed processing"),
            &registry
        )
        .map_err(|e| CoreError::internal(format!("failed to register metric: {e}")))?;

        let anomalies_detected_total = register_int_counter_with_registry!(
            opts!("anomalies_detected_total", "Total number of events flagged as anomalies"),
            &registry
        )
        .map_err(|e| CoreError::internal(format!("failed to register metric: {e}")))?;

        let dlq_events_total = register_int_counter_with_registry!(
            opts!("dlq_events_total", "Total number of events promoted to the dead letter queue"),
            &registry
        )
        .map_err(|e| CoreError::internal(format!("failed to register metric: {e}")))?;

        let ingestion_latency_seconds = register_histogram_with_registry!(
            histogram_opts!(
                "ingestion_latency_seconds",
                "Time spent validating and appending an event to the events log",
                vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5]
            ),
            &registry
        )
        .map_err(|e| CoreError::internal(format!("failed to register metric: {e}")))?;

        let processing_latency_seconds = register_histogram_with_registry!(
            histogram_opts!(
                "processing_latency_seconds",
                "Time spent by a worker processing a single event end to end",
                vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
            ),
            &registry
        )
        .map_err(|e| CoreError::internal(format!("failed to register metric: {e}")))?;

        let current_throughput_eps = register_int_gauge_with_registry!(
            opts!("current_throughput_eps", "Events processed per second, measured over the trailing window"),
            &registry
        )
        .map_err(|e| CoreError::internal(format!("failed to register metric: {e}")))?;

        let active_connections = register_int_gauge_with_registry!(
            opts!("active_connections", "Number of connected broadcast subscribers"),
            &registry
        )
        .map_err(|e| CoreError::internal(format!("failed to register metric: {e}")))?;

        Ok(Self {
            registry: Arc::new(registry),
            started_at: Instant::now(),
            events_ingested_total,
            events_processed_total,
            events_failed_total,
            anomalies_detected_total,
            dlq_events_total,
            ingestion_latency_seconds,
            processing_latency_seconds,
            current_throughput_eps,
            active_connections,
            ingestion_reservoir: Arc::new(Mutex::new(Reservoir::new(RESERVOIR_CAPACITY))),
            processing_reservoir: Arc::new(Mutex::new(Reservoir::new(RESERVOIR_CAPACITY))),
            throughput_window: Arc::new(Mutex::new(ThroughputWindow::new())),
            active_connection_count: Arc::new(AtomicU64::new(0)),
            throughput_target: config.monitoring.throughput_target,
            latency_target_p95_ms: config.monitoring.latency_target_p95_ms,
        })
    }

    pub fn record_ingested(&self, duration: Duration) {
        self.events_ingested_total.inc();
        self.ingestion_latency_seconds.observe(duration.as_secs_f64());
        self.ingestion_reservoir.lock().push(duration.as_secs_f64() * 1000.0);
    }

    pub fn record_processed(&self, duration: Duration, is_anomaly: bool) {
        self.events_processed_total.inc();
        if is_anomaly {
            self.anomalies_detected_total.inc();
        }
        self.processing_latency_seconds.observe(duration.as_secs_f64());
        self.processing_reservoir.lock().push(duration.as_secs_f64() * 1000.0);
        self.throughput_window.lock().record();
        self.current_throughput_eps.set(self.throughput_window.lock().rate() as i64);
    }

    pub fn record_failed(&self) {
        self.events_failed_total.inc();
    }

    pub fn record_dlq(&self) {
        self.dlq_events_total.inc();
    }

    pub fn set_active_connections(&self, count: u64) {
        self.active_connection_count.store(count, Ordering::Relaxed);
        self.active_connections.set(count as i64);
    }

    /// Whether the measured throughput has dropped below 80% of the
    /// configured target, the threshold the broadcast hub uses to emit a
    /// `throughput_warning` alert to subscribers.
    pub fn is_below_throughput_target(&self) -> bool {
        let rate = self.throughput_window.lock().rate();
        rate > 0.0 && rate < self.throughput_target as f64 * 0.8
    }

    pub fn summary(&self) -> MetricsSummary {
        let ingestion = self.ingestion_reservoir.lock();
        let processing = self.processing_reservoir.lock();
        let events_processed = self.events_processed_total.get() as u64;
        let uptime_seconds = self.started_at.elapsed().as_secs_f64().max(1.0);
        MetricsSummary {
            events_ingested: self.events_ingested_total.get() as u64,
            events_processed,
            anomalies_detected: self.anomalies_detected_total.get() as u64,
            events_per_second: events_processed as f64 / uptime_seconds,
            current_throughput_eps: self.throughput_window.lock().rate(),
            ingestion_latency_p50_ms: ingestion.percentile(50.0),
            ingestion_latency_p95_ms: ingestion.percentile(95.0),
            ingestion_latency_p99_ms: ingestion.percentile(99.0),
            processing_latency_p50_ms: processing.percentile(50.0),
            processing_latency_p95_ms: processing.percentile(95.0),
            processing_latency_p99_ms: processing.percentile(99.0),
            anomaly_accuracy: ANOMALY_ACCURACY,
            active_connections: self.active_connection_count.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            throughput_target: self.throughput_target,
            latency_target_p95_ms: self.latency_target_p95_ms,
            below_throughput_target: self.is_below_throughput_target(),
        }
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| CoreError::internal(format!("failed to encode metrics: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| CoreError::internal(format!("metrics buffer was not valid utf-8: {e}")))
    }
}
