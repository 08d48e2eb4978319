//! # Processing Records
//!
//! Typed internal representation of an event as it moves through the
//! pipeline, plus the single adapter that converts to and from the
//! string-to-string field maps the log boundary requires (the log
//! service is schema-less; see `log_client.rs`).
//!
//! Every stage below is additive: `EnrichedEvent` carries an `Event`,
//! `ProcessedEvent` carries an `EnrichedEvent`, and so on, mirroring the
//! lifecycle in the data model. Fields the core doesn't interpret pass
//! through untouched via `extras`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Raw ingress event as accepted by the ingest API, before enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub value: f64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Event {
    /// Build an `Event` from a raw JSON value without failing on missing or
    /// mistyped fields: each field is defaulted (empty string / NaN) so that
    /// `validate()` is the single place that rejects malformed input. Used
    /// by the ingest boundary so one bad element in a batch can't fail
    /// deserialization of the whole array (spec §4.4 / S3).
    pub fn from_value(value: &serde_json::Value) -> Self {
        let timestamp = value
            .get("timestamp")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .to_string();
        let event_type = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .to_string();
        let value_field = value
            .get("value")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(f64::NAN);
        let metadata = value
            .get("metadata")
            .and_then(serde_json::Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            timestamp,
            event_type,
            value: value_field,
            metadata,
        }
    }

    /// Validate required fields per spec: `timestamp`, `type`, `value` must
    /// all be present and `value` must be a finite number.
    pub fn validate(&self) -> Result<()> {
        if self.timestamp.trim().is_empty() {
            return Err(CoreError::validation("missing or empty timestamp"));
        }
        if self.event_type.trim().is_empty() {
            return Err(CoreError::validation("missing or empty type"));
        }
        if !self.value.is_finite() {
            return Err(CoreError::validation("value must be a finite number"));
        }
        Ok(())
    }

    pub fn enrich(self, ingested_at: DateTime<Utc>) -> EnrichedEvent {
        EnrichedEvent {
            timestamp: self.timestamp,
            event_type: self.event_type,
            value: self.value,
            extras: self.metadata,
            ingested_at,
            processed: false,
        }
    }
}

/// An `Event` plus ingest-time enrichment. Stored in the `events` log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedEvent {
    pub timestamp: String,
    pub event_type: String,
    pub value: f64,
    #[serde(default)]
    pub extras: HashMap<String, String>,
    pub ingested_at: DateTime<Utc>,
    pub processed: bool,
}

impl EnrichedEvent {
    pub fn into_processed(
        self,
        processed_at: DateTime<Utc>,
        worker_id: usize,
        is_anomaly: bool,
        z_score: f64,
        processing_time_ms: f64,
    ) -> ProcessedEvent {
        ProcessedEvent {
            source: self,
            processed_at,
            worker_id,
            anomaly_detected: is_anomaly,
            z_score,
            processing_time_ms,
        }
    }

    pub fn into_failed(self, error: impl Into<String>, failed_at: DateTime<Utc>) -> FailedEvent {
        FailedEvent {
            source: self,
            retry_count: 0,
            last_error: error.into(),
            failed_at,
        }
    }
}

/// An `EnrichedEvent` plus processing outcome. Stored in the `processed` log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    #[serde(flatten)]
    pub source: EnrichedEvent,
    pub processed_at: DateTime<Utc>,
    pub worker_id: usize,
    pub anomaly_detected: bool,
    pub z_score: f64,
    pub processing_time_ms: f64,
}

/// An `EnrichedEvent` plus retry bookkeeping. Either re-appended to
/// `events` or promoted to DLQ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEvent {
    #[serde(flatten)]
    pub source: EnrichedEvent,
    pub retry_count: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

impl FailedEvent {
    pub fn bump_retry(&mut self, error: impl Into<String>, failed_at: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_error = error.into();
        self.failed_at = failed_at;
    }

    pub fn into_dlq(self, original_event_id: String, reason: impl Into<String>) -> DlqEvent {
        let final_retry_count = self.retry_count;
        DlqEvent {
            source: self,
            original_event_id,
            dlq_reason: reason.into(),
            dlq_timestamp: Utc::now(),
            final_retry_count,
        }
    }
}

/// A `FailedEvent` that exhausted its retry budget. Stored in the `dlq` log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEvent {
    #[serde(flatten)]
    pub source: FailedEvent,
    pub original_event_id: String,
    pub dlq_reason: String,
    pub dlq_timestamp: DateTime<Utc>,
    pub final_retry_count: u32,
}

/// Keys stripped from a DLQ entry's fields before it is re-appended to
/// `events` by the admin retry operation (spec §4.6).
const DLQ_STRIP_PREFIXES: &[&str] = &["retry_count", "last_error", "failed_at", "dlq_"];

/// Convert a log entry's string field map into a clean `events`-log field
/// map, stripping anything the failure/DLQ path added. Used by
/// `retry_dlq_event`.
pub fn strip_dlq_fields(fields: &HashMap<String, String>) -> HashMap<String, String> {
    fields
        .iter()
        .filter(|(k, _)| !DLQ_STRIP_PREFIXES.iter().any(|prefix| k.starts_with(prefix)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Adapter: typed record -> log-boundary string field map.
pub mod fields {
    use super::*;

    pub fn from_enriched(event: &EnrichedEvent) -> HashMap<String, String> {
        let mut map = event.extras.clone();
        map.insert("timestamp".to_string(), event.timestamp.clone());
        map.insert("type".to_string(), event.event_type.clone());
        map.insert("value".to_string(), format_f64(event.value));
        map.insert("ingested_at".to_string(), event.ingested_at.to_rfc3339());
        map.insert("processed".to_string(), bool_str(event.processed));
        map
    }

    pub fn from_processed(event: &ProcessedEvent) -> HashMap<String, String> {
        let mut map = from_enriched(&event.source);
        map.insert("processed_at".to_string(), event.processed_at.to_rfc3339());
        map.insert("worker_id".to_string(), event.worker_id.to_string());
        map.insert(
            "anomaly_detected".to_string(),
            bool_str(event.anomaly_detected),
        );
        map.insert("z_score".to_string(), format_f64(event.z_score));
        map.insert(
            "processing_time".to_string(),
            format_f64(event.processing_time_ms),
        );
        map
    }

    pub fn from_failed(event: &FailedEvent) -> HashMap<String, String> {
        let mut map = from_enriched(&event.source);
        map.insert("retry_count".to_string(), event.retry_count.to_string());
        map.insert("last_error".to_string(), event.last_error.clone());
        map.insert("failed_at".to_string(), event.failed_at.to_rfc3339());
        map
    }

    pub fn from_dlq(event: &DlqEvent) -> HashMap<String, String> {
        let mut map = from_failed(&event.source);
        map.insert(
            "original_event_id".to_string(),
            event.original_event_id.clone(),
        );
        map.insert("dlq_reason".to_string(), event.dlq_reason.clone());
        map.insert(
            "dlq_timestamp".to_string(),
            event.dlq_timestamp.to_rfc3339(),
        );
        map.insert(
            "final_retry_count".to_string(),
            event.final_retry_count.to_string(),
        );
        map
    }

    /// Parse a log entry's raw field map back into an `EnrichedEvent`,
    /// the common entry point every worker reads from the `events` stream.
    pub fn to_enriched(fields: &HashMap<String, String>) -> Result<EnrichedEvent> {
        let timestamp = required(fields, "timestamp")?;
        let event_type = required(fields, "type")?;
        let value: f64 = required(fields, "value")?
            .parse()
            .map_err(|_| CoreError::validation("value is not a valid number"))?;
        let ingested_at = fields
            .get("ingested_at")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let processed = fields
            .get("processed")
            .map(|s| s == "true")
            .unwrap_or(false);

        let reserved = [
            "timestamp",
            "type",
            "value",
            "ingested_at",
            "processed",
            "processed_at",
            "worker_id",
            "anomaly_detected",
            "z_score",
            "processing_time",
            "retry_count",
            "last_error",
            "failed_at",
        ];
        let extras = fields
            .iter()
            .filter(|(k, _)| !reserved.contains(&k.as_str()) && !k.starts_with("dlq_"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(EnrichedEvent {
            timestamp,
            event_type,
            value,
            extras,
            ingested_at,
            processed,
        })
    }

    /// Parse a log entry's raw field map back into a `FailedEvent`. Used by
    /// the retry scheduler, which re-reads its own bookkeeping fields back
    /// off an `events` or `dlq` entry before bumping the retry count.
    pub fn to_failed(fields: &HashMap<String, String>) -> Result<FailedEvent> {
        let source = to_enriched(fields)?;
        let retry_count = fields
            .get("retry_count")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let last_error = fields.get("last_error").cloned().unwrap_or_default();
        let failed_at = fields
            .get("failed_at")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(FailedEvent {
            source,
            retry_count,
            last_error,
            failed_at,
        })
    }

    fn required(fields: &HashMap<String, String>, key: &str) -> Result<String> {
        fields
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::validation(format!("missing required field '{key}'")))
    }

    fn bool_str(value: bool) -> String {
        if value { "true" } else { "false" }.to_string()
    }

    /// Render a float the way Python's `str(float)` does: a whole-valued
    /// float keeps a trailing `.0` rather than collapsing to an integer
    /// literal (`42.0`, not `42`; `0.0`, not `0`). Matters at the log
    /// boundary since non-finite values never reach here (rejected by
    /// `Event::validate`) but whole results like a warm-up `z_score` of
    /// exactly `0.0` must still read as a decimal string (spec §6, S1).
    pub(crate) fn format_f64(value: f64) -> String {
        if value.fract() == 0.0 && value.is_finite() {
            format!("{value:.1}")
        } else {
            value.to_string()
        }
    }
}
