//! # Stream Ingestor
//!
//! Validates, enriches, and appends incoming events to the `events` log.
//! Grounded in spec §4.4: a batch is rejected wholesale only for being
//! oversize; individual invalid events within an otherwise-valid batch are
//! skipped rather than failing the whole request.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::log_client::LogClient;
use crate::metrics::MetricsRegistry;
use crate::record::{fields, Event};

/// Entries log names. Defined once here since `ingest.rs` is the only
/// writer to `events`; `worker.rs`/`retry.rs` reuse these constants.
pub const EVENTS_STREAM: &str = "events";
pub const PROCESSED_STREAM: &str = "processed";
pub const DLQ_STREAM: &str = "dlq";

pub const EVENTS_CAP: u64 = 1_000_000;
pub const PROCESSED_CAP: u64 = 1_000_000;
pub const DLQ_CAP: u64 = 100_000;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 1_000;

/// Outcome of an `ingest_batch` call, mirroring the admin API's
/// `(success, ingested, total, processing_time_ms, batch_id)` tuple (§6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestOutcome {
    pub success: bool,
    pub ingested: usize,
    pub total: usize,
    pub processing_time_ms: u64,
    pub batch_id: String,
}

pub struct StreamIngestor {
    log: Arc<dyn LogClient>,
    metrics: Arc<MetricsRegistry>,
    max_batch_size: usize,
}

impl StreamIngestor {
    pub fn new(log: Arc<dyn LogClient>, metrics: Arc<MetricsRegistry>, max_batch_size: usize) -> Self {
        Self {
            log,
            metrics,
            max_batch_size,
        }
    }

    /// Ingest a batch of raw event payloads. Rejects the whole batch if
    /// it's oversize; otherwise parses and validates each element
    /// independently, enriches the valid ones, and appends them to
    /// `events`. Takes `serde_json::Value` rather than a typed `Event` so
    /// that one structurally invalid element (missing `timestamp`, say)
    /// can be skipped without failing deserialization of the whole batch
    /// — mirroring the original `ingest_batch(list[dict])`, which never
    /// rejected a batch outright for one bad dict (spec §4.4, S3).
    pub async fn ingest_batch(&self, events: Vec<serde_json::Value>) -> Result<IngestOutcome> {
        let start = Instant::now();
        let batch_id = Uuid::new_v4().to_string();
        let total = events.len();

        if total > self.max_batch_size {
            return Err(CoreError::Validation {
                message: format!(
                    "batch of {total} events exceeds max_batch_size of {}",
                    self.max_batch_size
                ),
                field: Some("batch".to_string()),
            });
        }

        let mut ingested = 0usize;
        for raw in events {
            let event = Event::from_value(&raw);
            if let Err(e) = event.validate() {
                warn!(error = %e, "skipping invalid event in batch");
                continue;
            }

            let enriched = event.enrich(Utc::now());
            let map = fields::from_enriched(&enriched);

            match self.log.append(EVENTS_STREAM, &map, EVENTS_CAP).await {
                Ok(entry_id) => {
                    debug!(entry_id, "event ingested");
                    ingested += 1;
                }
                Err(e) => {
                    warn!(error = %e, "append to events log failed, continuing batch");
                }
            }
        }

        let elapsed = start.elapsed();
        self.metrics.record_ingested(elapsed);

        Ok(IngestOutcome {
            success: true,
            ingested,
            total,
            processing_time_ms: elapsed.as_millis() as u64,
            batch_id,
        })
    }

    /// Convenience wrapper for ingesting a single, already-typed event
    /// (§4.4 supplement, mirroring `POST /ingest/single`).
    pub async fn ingest_single(&self, event: Event) -> Result<IngestOutcome> {
        let raw = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        self.ingest_batch(vec![raw]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_client::InMemoryLogClient;
    use crate::config::Config;
    use std::collections::HashMap;

    fn valid_event(value: f64) -> Event {
        Event {
            timestamp: "2024-01-30T10:45:00Z".to_string(),
            event_type: "t".to_string(),
            value,
            metadata: HashMap::new(),
        }
    }

    fn valid_value(value: f64) -> serde_json::Value {
        serde_json::to_value(valid_event(value)).unwrap()
    }

    fn ingestor() -> (StreamIngestor, Arc<InMemoryLogClient>) {
        let log = InMemoryLogClient::new();
        let metrics = Arc::new(MetricsRegistry::new(&Config::default()).unwrap());
        (StreamIngestor::new(log.clone(), metrics, 3), log)
    }

    #[tokio::test]
    async fn all_valid_events_are_ingested() {
        let (ingestor, log) = ingestor();
        let outcome = ingestor
            .ingest_batch(vec![valid_value(1.0), valid_value(2.0)])
            .await
            .unwrap();
        assert_eq!(outcome.ingested, 2);
        assert_eq!(outcome.total, 2);
        let info = log.stream_info(EVENTS_STREAM).await.unwrap();
        assert_eq!(info.length, 2);
    }

    #[tokio::test]
    async fn invalid_event_is_skipped_not_fatal() {
        let (ingestor, log) = ingestor();
        let mut bad = valid_event(1.0);
        bad.timestamp.clear();
        let outcome = ingestor
            .ingest_batch(vec![serde_json::to_value(bad).unwrap(), valid_value(2.0)])
            .await
            .unwrap();
        assert_eq!(outcome.ingested, 1);
        assert_eq!(outcome.total, 2);
        let info = log.stream_info(EVENTS_STREAM).await.unwrap();
        assert_eq!(info.length, 1);
    }

    /// S3 — a raw JSON element with no `timestamp` key at all (not merely an
    /// empty string) is skipped, and the rest of the batch still succeeds.
    /// Exercises the boundary the typed `Vec<Event>` signature couldn't:
    /// a missing struct field would have failed to deserialize the whole
    /// batch before any per-event validation ran.
    #[tokio::test]
    async fn event_missing_required_key_entirely_is_skipped_not_fatal() {
        let (ingestor, log) = ingestor();
        let missing_timestamp = serde_json::json!({"type": "t", "value": 1.0});
        let outcome = ingestor.ingest_batch(vec![missing_timestamp]).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.ingested, 0);
        assert_eq!(outcome.total, 1);
        let info = log.stream_info(EVENTS_STREAM).await.unwrap();
        assert_eq!(info.length, 0);
    }

    #[tokio::test]
    async fn oversize_batch_is_rejected_wholesale() {
        let (ingestor, log) = ingestor();
        let events = vec![valid_value(1.0), valid_value(2.0), valid_value(3.0), valid_value(4.0)];
        let result = ingestor.ingest_batch(events).await;
        assert!(result.is_err());
        let info = log.stream_info(EVENTS_STREAM).await.unwrap();
        assert_eq!(info.length, 0);
    }

    #[tokio::test]
    async fn ingest_single_wraps_batch_of_one() {
        let (ingestor, _log) = ingestor();
        let outcome = ingestor.ingest_single(valid_event(1.0)).await.unwrap();
        assert_eq!(outcome.ingested, 1);
        assert_eq!(outcome.total, 1);
    }
}
