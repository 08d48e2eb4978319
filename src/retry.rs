//! # Retry Scheduler
//!
//! Bounded exponential-backoff retry with DLQ promotion, grounded in
//! `_handle_event_failure`/`_retry_event_later`/`_send_to_dlq`/
//! `retry_dlq_event` from the original worker service. The retry delay
//! runs as a self-terminating spawned task (§5 "transient retry-delay
//! task per failing event") rather than blocking the worker that observed
//! the failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::RetryConfig;
use crate::error::Result;
use crate::ingest::{DLQ_CAP, DLQ_STREAM, EVENTS_CAP, EVENTS_STREAM};
use crate::log_client::LogClient;
use crate::metrics::MetricsRegistry;
use crate::record::{self, DlqEvent};

#[derive(Clone)]
pub struct RetryScheduler {
    log: Arc<dyn LogClient>,
    metrics: Arc<MetricsRegistry>,
    max_retries: u32,
    backoff_base: f64,
    dlq_enabled: bool,
}

impl RetryScheduler {
    pub fn new(log: Arc<dyn LogClient>, metrics: Arc<MetricsRegistry>, config: &RetryConfig) -> Self {
        Self {
            log,
            metrics,
            max_retries: config.max_retries,
            backoff_base: config.backoff_base,
            dlq_enabled: config.dlq_enabled,
        }
    }

    pub fn backoff_delay_secs(&self, retry_count: u32) -> f64 {
        self.backoff_base.powi(retry_count as i32)
    }

    /// Handle a processing failure for the entry identified by
    /// `original_event_id`, whose current field map is `fields`. Bumps
    /// `retry_count`/`last_error`/`failed_at`, then either schedules a
    /// delayed re-append to `events` or promotes straight to DLQ.
    pub async fn handle_failure(
        &self,
        original_event_id: String,
        mut fields: HashMap<String, String>,
        error: impl Into<String>,
    ) {
        let error = error.into();
        let retry_count: u32 = fields
            .get("retry_count")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
            + 1;

        fields.insert("retry_count".to_string(), retry_count.to_string());
        fields.insert("last_error".to_string(), error.clone());
        fields.insert("failed_at".to_string(), chrono::Utc::now().to_rfc3339());

        if retry_count <= self.max_retries {
            let delay = Duration::from_secs_f64(self.backoff_delay_secs(retry_count));
            warn!(
                event_id = %original_event_id,
                retry_count,
                delay_secs = delay.as_secs_f64(),
                error = %error,
                "scheduling retry with exponential backoff"
            );

            let scheduler = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                match scheduler.log.append(EVENTS_STREAM, &fields, EVENTS_CAP).await {
                    Ok(entry_id) => {
                        info!(event_id = %original_event_id, entry_id, retry_count, "event retried");
                    }
                    Err(e) => {
                        warn!(event_id = %original_event_id, error = %e, "retry re-append failed, promoting to dlq");
                        scheduler
                            .promote_to_dlq(original_event_id, fields, format!("retry re-append failed: {e}"))
                            .await;
                    }
                }
            });
        } else {
            self.promote_to_dlq(original_event_id, fields, "max retries exceeded").await;
        }
    }

    async fn promote_to_dlq(&self, original_event_id: String, fields: HashMap<String, String>, reason: impl Into<String>) {
        if !self.dlq_enabled {
            warn!(event_id = %original_event_id, "dlq disabled, dropping event after exhausted retries");
            return;
        }

        let reason = reason.into();
        let failed = match record::fields::to_failed(&fields) {
            Ok(failed) => failed,
            Err(e) => {
                warn!(event_id = %original_event_id, error = %e, "could not parse failed event for dlq, dropping");
                return;
            }
        };

        let dlq_event: DlqEvent = failed.into_dlq(original_event_id.clone(), reason.clone());
        let map = record::fields::from_dlq(&dlq_event);

        match self.log.append(DLQ_STREAM, &map, DLQ_CAP).await {
            Ok(entry_id) => {
                self.metrics.record_dlq();
                tracing::error!(
                    event_id = %original_event_id,
                    dlq_entry_id = entry_id,
                    reason = %reason,
                    retry_count = dlq_event.final_retry_count,
                    "event sent to dlq"
                );
            }
            Err(e) => {
                warn!(event_id = %original_event_id, error = %e, "dlq append failed");
            }
        }
    }

    /// Promote a single fields map directly to DLQ without going through
    /// the retry-count bump, used when a worker observes an unrecoverable
    /// error that should never be retried.
    pub async fn send_to_dlq(&self, original_event_id: String, fields: HashMap<String, String>, reason: impl Into<String>) {
        self.promote_to_dlq(original_event_id, fields, reason).await;
    }

    /// Admin operation: re-admit a DLQ entry into `events` after stripping
    /// retry/failure/dlq bookkeeping fields (§4.6).
    pub async fn retry_dlq_event(&self, entry_id: &str) -> Result<bool> {
        let entries = self.log.read_range(DLQ_STREAM, entry_id, entry_id, false, 1).await?;
        let Some((_, raw_fields)) = entries.into_iter().next() else {
            return Ok(false);
        };

        let cleaned = record::strip_dlq_fields(&raw_fields);
        self.log.append(EVENTS_STREAM, &cleaned, EVENTS_CAP).await?;
        self.log.delete(DLQ_STREAM, entry_id).await?;

        info!(entry_id, "dlq event retried");
        Ok(true)
    }

    /// List the most recent DLQ entries, newest first, for the admin
    /// `list_dlq` operation (§6).
    pub async fn list_dlq(&self, limit: usize) -> Result<Vec<(String, HashMap<String, String>)>> {
        self.log.read_range(DLQ_STREAM, "-", "+", true, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::log_client::InMemoryLogClient;

    fn scheduler() -> (RetryScheduler, Arc<InMemoryLogClient>) {
        let log = InMemoryLogClient::new();
        let metrics = Arc::new(MetricsRegistry::new(&Config::default()).unwrap());
        let config = Config::default();
        (RetryScheduler::new(log.clone(), metrics, &config.retry), log)
    }

    fn sample_fields() -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("timestamp".to_string(), "2024-01-30T10:45:00Z".to_string());
        fields.insert("type".to_string(), "t".to_string());
        fields.insert("value".to_string(), "1.0".to_string());
        fields
    }

    #[test]
    fn backoff_delay_matches_base_to_the_k() {
        let (scheduler, _log) = scheduler();
        assert_eq!(scheduler.backoff_delay_secs(1), 2.0);
        assert_eq!(scheduler.backoff_delay_secs(2), 4.0);
        assert_eq!(scheduler.backoff_delay_secs(3), 8.0);
    }

    #[tokio::test]
    async fn failure_past_max_retries_goes_straight_to_dlq() {
        let (scheduler, log) = scheduler();
        let mut fields = sample_fields();
        fields.insert("retry_count".to_string(), "3".to_string());

        scheduler.handle_failure("evt-1".to_string(), fields, "boom").await;

        let info = log.stream_info(DLQ_STREAM).await.unwrap();
        assert_eq!(info.length, 1);
    }

    #[tokio::test]
    async fn retry_dlq_event_strips_bookkeeping_and_readmits() {
        let (scheduler, log) = scheduler();
        let mut fields = sample_fields();
        fields.insert("retry_count".to_string(), "3".to_string());
        fields.insert("last_error".to_string(), "boom".to_string());
        fields.insert("failed_at".to_string(), chrono::Utc::now().to_rfc3339());
        fields.insert("dlq_reason".to_string(), "max retries exceeded".to_string());
        let dlq_id = log.append(DLQ_STREAM, &fields, DLQ_CAP).await.unwrap();

        let retried = scheduler.retry_dlq_event(&dlq_id).await.unwrap();
        assert!(retried);

        let events_info = log.stream_info(EVENTS_STREAM).await.unwrap();
        assert_eq!(events_info.length, 1);
        let dlq_info = log.stream_info(DLQ_STREAM).await.unwrap();
        assert_eq!(dlq_info.length, 0);

        let (_, readmitted) = log.read_range(EVENTS_STREAM, "-", "+", false, 1).await.unwrap().remove(0);
        assert!(!readmitted.contains_key("retry_count"));
        assert!(!readmitted.contains_key("dlq_reason"));
    }

    #[tokio::test]
    async fn retry_dlq_event_missing_id_returns_false() {
        let (scheduler, _log) = scheduler();
        assert!(!scheduler.retry_dlq_event("does-not-exist").await.unwrap());
    }
}
