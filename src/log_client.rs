//! # Log Client
//!
//! Thin abstraction over an append-only log service, the only component
//! that touches the external log directly (Redis Streams). Every other
//! component is parameterized by a `Arc<dyn LogClient>`, so worker-pool
//! and retry-scheduler tests can substitute `InMemoryLogClient` instead
//! of standing up Redis.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::config::RedisConfig;
use crate::error::{CoreError, Result};
use crate::types::ComponentHealth;

/// One entry read back from a log: its assigned id and its field map.
pub type LogEntry = (String, HashMap<String, String>);

/// Stream/group/first-last summary used for health reporting and the
/// `stream_info` admin operation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamInfo {
    pub length: u64,
    pub groups: u64,
    pub first_entry: Option<String>,
    pub last_entry: Option<String>,
}

/// Abstract append-only log with three named streams: `events`,
/// `processed`, `dlq`. All other components depend on this trait, not
/// on Redis directly.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Append one entry, evicting the oldest entries beyond `cap`.
    async fn append(&self, stream: &str, fields: &HashMap<String, String>, cap: u64) -> Result<String>;

    /// Read entries with id greater than `from_id`, blocking up to
    /// `block_ms` for at least one entry. `from_id = "$"` means "only
    /// entries appended after this call started".
    async fn read_tail(
        &self,
        stream: &str,
        from_id: &str,
        block_ms: u64,
        max_count: usize,
    ) -> Result<Vec<LogEntry>>;

    /// Range read, optionally reversed, bounded by `count`.
    async fn read_range(
        &self,
        stream: &str,
        min_id: &str,
        max_id: &str,
        reverse: bool,
        count: usize,
    ) -> Result<Vec<LogEntry>>;

    async fn delete(&self, stream: &str, entry_id: &str) -> Result<bool>;

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo>;

    async fn health_check(&self) -> ComponentHealth;
}

/// Redis Streams-backed `LogClient`.
#[derive(Clone)]
pub struct RedisLogClient {
    conn: redis::aio::ConnectionManager,
    url: String,
}

impl RedisLogClient {
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| CoreError::log(format!("failed to create Redis client: {e}"), None))?;

        let mut probe = client
            .get_async_connection()
            .await
            .map_err(|e| CoreError::log(format!("failed to connect to Redis: {e}"), None))?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut probe)
            .await
            .map_err(|e| CoreError::log(format!("Redis ping failed: {e}"), None))?;

        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| CoreError::log(format!("failed to create connection manager: {e}"), None))?;

        Ok(Self {
            conn,
            url: config.url.clone(),
        })
    }

    fn stream_key(stream: &str) -> String {
        format!("{stream}:stream")
    }

    fn entry_from_stream_id(id: &redis::streams::StreamId) -> LogEntry {
        let fields = id
            .map
            .iter()
            .map(|(k, v)| (k.clone(), redis_value_to_string(v)))
            .collect();
        (id.id.clone(), fields)
    }
}

#[async_trait]
impl LogClient for RedisLogClient {
    async fn append(&self, stream: &str, fields: &HashMap<String, String>, cap: u64) -> Result<String> {
        let key = Self::stream_key(stream);
        let mut conn = self.conn.clone();

        let items: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let entry_id: String = conn
            .xadd_maxlen(&key, StreamMaxlen::Approx(cap), "*", &items)
            .await
            .map_err(|e| CoreError::log(format!("append to {stream} failed: {e}"), Some(stream.to_string())))?;

        debug!(stream, entry_id, "appended log entry");
        Ok(entry_id)
    }

    async fn read_tail(
        &self,
        stream: &str,
        from_id: &str,
        block_ms: u64,
        max_count: usize,
    ) -> Result<Vec<LogEntry>> {
        let key = Self::stream_key(stream);
        let mut conn = self.conn.clone();

        let opts = StreamReadOptions::default()
            .count(max_count)
            .block(block_ms as usize);

        let start = Instant::now();
        let reply: StreamReadReply = conn
            .xread_options(&[&key], &[from_id], &opts)
            .await
            .map_err(|e| CoreError::log(format!("read_tail on {stream} failed: {e}"), Some(stream.to_string())))?;

        let mut entries = Vec::new();
        for stream_data in reply.keys {
            for id in stream_data.ids {
                entries.push(Self::entry_from_stream_id(&id));
            }
        }

        debug!(
            stream,
            count = entries.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "read_tail completed"
        );
        Ok(entries)
    }

    async fn read_range(
        &self,
        stream: &str,
        min_id: &str,
        max_id: &str,
        reverse: bool,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let key = Self::stream_key(stream);
        let mut conn = self.conn.clone();

        let reply: Vec<redis::streams::StreamId> = if reverse {
            conn.xrevrange_count(&key, max_id, min_id, count).await
        } else {
            conn.xrange_count(&key, min_id, max_id, count).await
        }
        .map_err(|e| CoreError::log(format!("read_range on {stream} failed: {e}"), Some(stream.to_string())))?;

        Ok(reply.iter().map(Self::entry_from_stream_id).collect())
    }

    async fn delete(&self, stream: &str, entry_id: &str) -> Result<bool> {
        let key = Self::stream_key(stream);
        let mut conn = self.conn.clone();

        let deleted: u64 = conn
            .xdel(&key, &[entry_id])
            .await
            .map_err(|e| CoreError::log(format!("delete on {stream} failed: {e}"), Some(stream.to_string())))?;

        Ok(deleted > 0)
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let key = Self::stream_key(stream);
        let mut conn = self.conn.clone();

        let info: HashMap<String, redis::Value> = match conn.xinfo_stream(&key).await {
            Ok(info) => info,
            Err(e) => {
                warn!(stream, error = %e, "stream_info: stream may not exist yet");
                return Ok(StreamInfo {
                    length: 0,
                    groups: 0,
                    first_entry: None,
                    last_entry: None,
                });
            }
        };

        let length = info
            .get("length")
            .map(redis_value_to_i64)
            .unwrap_or(0)
            .max(0) as u64;
        let groups = info
            .get("groups")
            .map(redis_value_to_i64)
            .unwrap_or(0)
            .max(0) as u64;

        Ok(StreamInfo {
            length,
            groups,
            first_entry: info.get("first-entry").map(|_| "present".to_string()),
            last_entry: info.get("last-entry").map(|_| "present".to_string()),
        })
    }

    async fn health_check(&self) -> ComponentHealth {
        let start = Instant::now();
        let mut conn = self.conn.clone();
        match redis::cmd("PING").query_async::<_, String>(&mut conn).await {
            Ok(_) => ComponentHealth::healthy("redis_log", start.elapsed().as_millis() as u64),
            Err(e) => ComponentHealth::unhealthy("redis_log", format!("{} ({})", e, self.url)),
        }
    }
}

fn redis_value_to_string(value: &redis::Value) -> String {
    match value {
        redis::Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        redis::Value::Status(s) => s.clone(),
        redis::Value::Int(i) => i.to_string(),
        redis::Value::Okay => "OK".to_string(),
        redis::Value::Nil => String::new(),
        redis::Value::Bulk(_) => "bulk".to_string(),
    }
}

fn redis_value_to_i64(value: &redis::Value) -> i64 {
    match value {
        redis::Value::Int(i) => *i,
        redis::Value::Data(data) => String::from_utf8_lossy(data).parse().unwrap_or(0),
        _ => 0,
    }
}

/// In-memory `LogClient` used by component tests and by `mockall`-free
/// unit tests that need real append/read semantics without Redis.
pub struct InMemoryLogClient {
    streams: parking_lot::Mutex<HashMap<String, Vec<LogEntry>>>,
    counter: std::sync::atomic::AtomicU64,
}

impl Default for InMemoryLogClient {
    fn default() -> Self {
        Self {
            streams: parking_lot::Mutex::new(HashMap::new()),
            counter: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl InMemoryLogClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        format!("{n:020}-0")
    }
}

#[async_trait]
impl LogClient for InMemoryLogClient {
    async fn append(&self, stream: &str, fields: &HashMap<String, String>, cap: u64) -> Result<String> {
        let id = self.next_id();
        let mut streams = self.streams.lock();
        let entries = streams.entry(stream.to_string()).or_default();
        entries.push((id.clone(), fields.clone()));
        while entries.len() as u64 > cap {
            entries.remove(0);
        }
        Ok(id)
    }

    async fn read_tail(
        &self,
        stream: &str,
        from_id: &str,
        _block_ms: u64,
        max_count: usize,
    ) -> Result<Vec<LogEntry>> {
        let streams = self.streams.lock();
        let entries = match streams.get(stream) {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };
        let start = if from_id == "$" || from_id == "0" {
            0
        } else {
            entries
                .iter()
                .position(|(id, _)| id.as_str() == from_id)
                .map(|pos| pos + 1)
                .unwrap_or(0)
        };
        Ok(entries.iter().skip(start).take(max_count).cloned().collect())
    }

    async fn read_range(
        &self,
        stream: &str,
        min_id: &str,
        max_id: &str,
        reverse: bool,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let streams = self.streams.lock();
        let entries = match streams.get(stream) {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };
        let mut filtered: Vec<LogEntry> = entries
            .iter()
            .filter(|(id, _)| {
                (min_id == "-" || id.as_str() >= min_id) && (max_id == "+" || id.as_str() <= max_id)
            })
            .cloned()
            .collect();
        if reverse {
            filtered.reverse();
        }
        filtered.truncate(count);
        Ok(filtered)
    }

    async fn delete(&self, stream: &str, entry_id: &str) -> Result<bool> {
        let mut streams = self.streams.lock();
        if let Some(entries) = streams.get_mut(stream) {
            let before = entries.len();
            entries.retain(|(id, _)| id != entry_id);
            return Ok(entries.len() != before);
        }
        Ok(false)
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let streams = self.streams.lock();
        let entries = streams.get(stream);
        Ok(StreamInfo {
            length: entries.map(|e| e.len() as u64).unwrap_or(0),
            groups: 0,
            first_entry: entries.and_then(|e| e.first()).map(|(id, _)| id.clone()),
            last_entry: entries.and_then(|e| e.last()).map(|(id, _)| id.clone()),
        })
    }

    async fn health_check(&self) -> ComponentHealth {
        ComponentHealth::healthy("in_memory_log", 0)
    }
}
