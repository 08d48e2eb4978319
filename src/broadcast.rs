//! # Broadcast Hub
//!
//! Subscriber set plus the periodic fan-out loop, grounded in
//! `websocket_manager.py`'s `WebSocketManager` and `api/routes/websocket.py`'s
//! message dispatch table. A subscriber is represented here as an
//! unbounded `mpsc` sender; the HTTP adapter's `/ws` handler owns the
//! actual socket and simply forwards whatever this hub sends down the
//! channel, which keeps the hub transport-agnostic and trivially testable
//! without a real WebSocket upgrade.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::ingest::PROCESSED_STREAM;
use crate::log_client::LogClient;
use crate::metrics::MetricsRegistry;

const BROADCAST_INTERVAL: Duration = Duration::from_secs(5);
const RECENT_EVENTS_COUNT: usize = 10;
const ANOMALY_HIGH_SEVERITY_THRESHOLD: f64 = 4.0;

struct Subscriber {
    client_id: String,
    connected_at: DateTime<Utc>,
    message_count: AtomicU64,
    sender: mpsc::UnboundedSender<String>,
}

/// Handle returned to the transport adapter on `connect`: a receiver for
/// outbound frames and the assigned client id.
pub struct Connection {
    pub client_id: String,
    pub receiver: mpsc::UnboundedReceiver<String>,
}

#[derive(Clone)]
pub struct BroadcastHub {
    subscribers: Arc<DashMap<String, Subscriber>>,
    log: Arc<dyn LogClient>,
    metrics: Arc<MetricsRegistry>,
}

impl BroadcastHub {
    pub fn new(log: Arc<dyn LogClient>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            log,
            metrics,
        }
    }

    /// Register a new subscriber session (§4.7). `client_id` is
    /// client-supplied or synthesized as `client_<n>`.
    pub fn connect(&self, client_id: Option<String>) -> Connection {
        let (tx, rx) = mpsc::unbounded_channel();
        let client_id = client_id.unwrap_or_else(|| format!("client_{}", self.subscribers.len()));

        self.subscribers.insert(
            client_id.clone(),
            Subscriber {
                client_id: client_id.clone(),
                connected_at: Utc::now(),
                message_count: AtomicU64::new(0),
                sender: tx,
            },
        );
        self.metrics.set_active_connections(self.subscribers.len() as u64);

        let _ = self.send(
            &client_id,
            json!({
                "type": "connected",
                "client_id": client_id,
                "message": "connected to pulsecore real-time stream",
            }),
        );

        info!(client_id, total = self.subscribers.len(), "subscriber connected");
        Connection {
            client_id,
            receiver: rx,
        }
    }

    /// Remove a subscriber. Idempotent.
    pub fn disconnect(&self, client_id: &str) {
        if self.subscribers.remove(client_id).is_some() {
            self.metrics.set_active_connections(self.subscribers.len() as u64);
            info!(client_id, total = self.subscribers.len(), "subscriber disconnected");
        }
    }

    /// Serialize and send `message` to one subscriber. On failure the
    /// session is removed (a channel only closes once its receiver, owned
    /// by the transport adapter, has dropped — meaning the socket is gone).
    pub fn send(&self, client_id: &str, message: Value) -> bool {
        let Some(subscriber) = self.subscribers.get(client_id) else {
            return false;
        };
        let text = message.to_string();
        if subscriber.sender.send(text).is_err() {
            drop(subscriber);
            self.disconnect(client_id);
            return false;
        }
        subscriber.message_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Broadcast to a snapshot of the subscriber set. Failed sends are
    /// collected and removed only after the full iteration completes, so
    /// the set is never mutated while being walked (§5).
    pub fn broadcast(&self, message: Value) {
        if self.subscribers.is_empty() {
            return;
        }
        let text = message.to_string();
        let mut failed = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.sender.send(text.clone()).is_err() {
                failed.push(entry.client_id.clone());
            } else {
                entry.message_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        for client_id in &failed {
            self.disconnect(client_id);
        }
        if !failed.is_empty() {
            debug!(count = failed.len(), "cleaned up disconnected subscribers after broadcast");
        }
    }

    pub fn active_connection_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Connection statistics for the `get_stats` frame and `/worker/stats`-
    /// adjacent admin surface.
    pub fn connection_stats(&self) -> Value {
        let total_messages: u64 = self
            .subscribers
            .iter()
            .map(|s| s.message_count.load(Ordering::Relaxed))
            .sum();

        let connections: Vec<Value> = self
            .subscribers
            .iter()
            .map(|s| {
                json!({
                    "client_id": s.client_id,
                    "connected_at": s.connected_at.to_rfc3339(),
                    "message_count": s.message_count.load(Ordering::Relaxed),
                    "duration_seconds": (Utc::now() - s.connected_at).num_seconds(),
                })
            })
            .collect();

        json!({
            "active_connections": self.subscribers.len(),
            "total_messages_sent": total_messages,
            "connections": connections,
        })
    }

    /// Dispatch one incoming client frame (§4.7's client-to-server table).
    /// Malformed JSON produces an error frame rather than closing the
    /// session.
    pub fn handle_incoming(&self, client_id: &str, raw: &str) {
        let parsed: Result<Value, _> = serde_json::from_str(raw);
        let message = match parsed {
            Ok(value) => value,
            Err(_) => {
                self.send(client_id, json!({"type": "error", "message": "Invalid JSON format"}));
                return;
            }
        };

        match message.get("type").and_then(Value::as_str) {
            Some("ping") => {
                self.send(client_id, json!({"type": "pong", "timestamp": Utc::now().to_rfc3339()}));
            }
            Some("subscribe") => self.handle_subscribe(client_id, &message),
            Some("get_metrics") => {
                let summary = self.metrics.summary();
                self.send(client_id, json!({"type": "metrics_response", "data": summary}));
            }
            Some("get_stats") => {
                let stats = self.connection_stats();
                self.send(client_id, json!({"type": "stats_response", "data": stats}));
            }
            other => {
                let kind = other.unwrap_or("missing");
                self.send(client_id, json!({"type": "error", "message": format!("Unknown message type: {kind}")}));
            }
        }
    }

    fn handle_subscribe(&self, client_id: &str, message: &Value) {
        match message.get("subscription").and_then(Value::as_str) {
            Some(sub @ ("metrics" | "events" | "anomalies")) => {
                self.send(
                    client_id,
                    json!({
                        "type": "subscription_confirmed",
                        "subscription": sub,
                        "message": format!("subscribed to {sub} updates"),
                    }),
                );
            }
            other => {
                let kind = other.unwrap_or("missing");
                self.send(client_id, json!({"type": "error", "message": format!("Unknown subscription type: {kind}")}));
            }
        }
    }

    /// Push an immediate alert when a worker detects an anomaly (§4.7).
    pub fn notify_anomaly(&self, event_id: &str, value: f64, z_score: f64, processed_at: DateTime<Utc>) {
        let severity = if z_score.abs() > ANOMALY_HIGH_SEVERITY_THRESHOLD { "high" } else { "medium" };
        self.broadcast(json!({
            "type": "anomaly_alert",
            "data": {
                "event_id": event_id,
                "value": value,
                "z_score": z_score,
                "timestamp": processed_at.to_rfc3339(),
                "severity": severity,
            },
            "alert_timestamp": Utc::now().to_rfc3339(),
        }));
    }

    fn notify_throughput_warning(&self, summary: &crate::metrics::MetricsSummary) {
        let performance_ratio = if summary.throughput_target > 0 {
            summary.current_throughput_eps / summary.throughput_target as f64
        } else {
            0.0
        };
        self.broadcast(json!({
            "type": "throughput_warning",
            "data": {
                "current_throughput": summary.current_throughput_eps,
                "target_throughput": summary.throughput_target,
                "threshold": summary.throughput_target as f64 * 0.8,
                "performance_ratio": performance_ratio,
            },
            "warning_timestamp": Utc::now().to_rfc3339(),
        }));
    }

    /// Spawn the periodic broadcast loop (§4.7). Every tick: broadcast a
    /// metrics snapshot, reverse-read the last `RECENT_EVENTS_COUNT`
    /// processed entries and broadcast them, and emit a throughput warning
    /// if the measured rate has fallen below 80% of target. Errors are
    /// logged; the loop never terminates on a per-iteration failure.
    pub fn spawn_broadcast_loop(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BROADCAST_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.broadcast_tick().await;
                    }
                    _ = shutdown.recv() => {
                        debug!("broadcast loop received shutdown signal");
                        break;
                    }
                }
            }
        });
    }

    async fn broadcast_tick(&self) {
        let summary = self.metrics.summary();
        self.broadcast(json!({"type": "metrics", "data": summary, "timestamp": Utc::now().to_rfc3339()}));

        if summary.below_throughput_target {
            self.notify_throughput_warning(&summary);
        }

        match self.log.read_range(PROCESSED_STREAM, "-", "+", true, RECENT_EVENTS_COUNT).await {
            Ok(entries) => {
                if !entries.is_empty() {
                    let data: Vec<Value> = entries
                        .into_iter()
                        .map(|(id, fields)| json!({"id": id, "data": fields}))
                        .collect();
                    self.broadcast(json!({"type": "recent_events", "data": &data, "count": data.len()}));
                }
            }
            Err(e) => {
                error!(error = %e, "failed to read recent processed events for broadcast");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::log_client::InMemoryLogClient;

    fn hub() -> BroadcastHub {
        let log = InMemoryLogClient::new();
        let metrics = Arc::new(MetricsRegistry::new(&Config::default()).unwrap());
        BroadcastHub::new(log, metrics)
    }

    #[test]
    fn connect_assigns_synthetic_client_id_and_sends_welcome() {
        let hub = hub();
        let mut conn = hub.connect(None);
        assert_eq!(conn.client_id, "client_0");
        let welcome = conn.receiver.try_recv().unwrap();
        assert!(welcome.contains("\"type\":\"connected\""));
    }

    #[test]
    fn synthetic_client_ids_count_subscribers_present_before_insert() {
        let hub = hub();
        let mut first = hub.connect(None);
        let mut second = hub.connect(None);
        first.receiver.try_recv().unwrap();
        second.receiver.try_recv().unwrap();
        assert_eq!(first.client_id, "client_0");
        assert_eq!(second.client_id, "client_1");
    }

    #[test]
    fn disconnect_is_idempotent_and_updates_count() {
        let hub = hub();
        let conn = hub.connect(Some("alice".to_string()));
        assert_eq!(hub.active_connection_count(), 1);
        hub.disconnect(&conn.client_id);
        hub.disconnect(&conn.client_id);
        assert_eq!(hub.active_connection_count(), 0);
    }

    #[test]
    fn broadcast_reaches_all_subscribers() {
        let hub = hub();
        let mut a = hub.connect(Some("a".to_string()));
        let mut b = hub.connect(Some("b".to_string()));
        a.receiver.try_recv().unwrap(); // drain welcome
        b.receiver.try_recv().unwrap();

        hub.broadcast(json!({"type": "metrics", "data": {}}));
        assert!(a.receiver.try_recv().unwrap().contains("\"type\":\"metrics\""));
        assert!(b.receiver.try_recv().unwrap().contains("\"type\":\"metrics\""));
    }

    #[test]
    fn broadcast_removes_subscriber_whose_receiver_dropped() {
        let hub = hub();
        let conn = hub.connect(Some("gone".to_string()));
        drop(conn.receiver);

        hub.broadcast(json!({"type": "metrics"}));
        assert_eq!(hub.active_connection_count(), 0);
    }

    #[test]
    fn malformed_json_yields_error_frame_without_disconnecting() {
        let hub = hub();
        let mut conn = hub.connect(Some("c".to_string()));
        conn.receiver.try_recv().unwrap(); // drain welcome

        hub.handle_incoming(&conn.client_id, "not json");
        let reply = conn.receiver.try_recv().unwrap();
        assert!(reply.contains("Invalid JSON format"));
        assert_eq!(hub.active_connection_count(), 1);
    }

    #[test]
    fn ping_replies_with_pong() {
        let hub = hub();
        let mut conn = hub.connect(Some("c".to_string()));
        conn.receiver.try_recv().unwrap();

        hub.handle_incoming(&conn.client_id, r#"{"type": "ping"}"#);
        let reply = conn.receiver.try_recv().unwrap();
        assert!(reply.contains("\"type\":\"pong\""));
    }

    #[test]
    fn anomaly_alert_severity_depends_on_z_score_threshold() {
        let hub = hub();
        let mut conn = hub.connect(Some("c".to_string()));
        conn.receiver.try_recv().unwrap();

        hub.notify_anomaly("evt-1", 1000.0, 5.0, Utc::now());
        let reply = conn.receiver.try_recv().unwrap();
        assert!(reply.contains("\"severity\":\"high\""));
    }
}
