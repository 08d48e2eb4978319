//! # pulsecore
//!
//! Event processing core of a real-time analytics pipeline: ingestion
//! enrichment, multi-worker concurrent consumption of an append-only log,
//! streaming Z-score anomaly detection, bounded exponential-backoff retry
//! with a dead-letter log, and broadcast fan-out to subscriber sessions
//! with periodic metrics snapshots and per-event alerts.
//!
//! HTTP framing, configuration loading, structured logging setup,
//! authentication, and the frontend dashboard are thin adapters around
//! this core and live in `handlers.rs`/`server.rs`/`main.rs`.

pub mod anomaly;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod log_client;
pub mod metrics;
pub mod record;
pub mod retry;
pub mod server;
pub mod types;
pub mod worker;

pub use config::Config;
pub use error::{CoreError, Result};
pub use server::PipelineService;

/// Version information, surfaced in `/health` and the CLI `--version` flag.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SERVICE_NAME: &str = "pulsecore";
