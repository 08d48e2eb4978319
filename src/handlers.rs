//! # HTTP/WS Handlers
//!
//! Thin axum handlers over the admin/ingest capability table in spec §6.
//! Every handler just extracts `State<PipelineService>` and calls into the
//! core; no business logic lives here.

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use tracing::{error, warn};

use crate::record::Event;
use crate::server::PipelineService;

/// `GET /health` — aggregate health across log client and worker pool.
pub async fn health(State(service): State<PipelineService>) -> Json<serde_json::Value> {
    Json(service.health().await)
}

/// `GET /health/ready` — ready as long as the worker pool has been started.
pub async fn readiness(
    State(service): State<PipelineService>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if service.worker_pool.is_running() {
        Ok(Json(serde_json::json!({"status": "ready"})))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// `GET /health/live` — always alive once the process is handling requests.
pub async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "alive", "timestamp": chrono::Utc::now()}))
}

/// `GET /metrics` — Prometheus text exposition format.
pub async fn prometheus_metrics(
    State(service): State<PipelineService>,
) -> Result<String, StatusCode> {
    service.metrics.export_prometheus().map_err(|e| {
        error!(error = %e, "failed to export metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// `POST /ingest` — batch ingest (§4.4, §6 `ingest_batch`). Accepts raw JSON
/// elements rather than the typed `Event` so a structurally invalid element
/// (missing `timestamp`, say) is skipped by the ingestor's per-event
/// validation instead of failing deserialization of the whole batch (S3).
pub async fn ingest_batch(
    State(service): State<PipelineService>,
    Json(events): Json<Vec<serde_json::Value>>,
) -> Result<Json<crate::ingest::IngestOutcome>, (StatusCode, String)> {
    service
        .ingestor
        .ingest_batch(events)
        .await
        .map(Json)
        .map_err(core_error_response)
}

/// `POST /ingest/single` — convenience single-event ingest.
pub async fn ingest_single(
    State(service): State<PipelineService>,
    Json(event): Json<Event>,
) -> Result<Json<crate::ingest::IngestOutcome>, (StatusCode, String)> {
    service
        .ingestor
        .ingest_single(event)
        .await
        .map(Json)
        .map_err(core_error_response)
}

/// `GET /api/metrics` — JSON metrics summary (§4.3 `summary()`).
pub async fn metrics_summary(
    State(service): State<PipelineService>,
) -> Json<crate::metrics::MetricsSummary> {
    Json(service.metrics.summary())
}

/// `GET /api/worker/stats` — worker pool counters and success rate.
pub async fn worker_stats(State(service): State<PipelineService>) -> Json<crate::worker::WorkerStats> {
    Json(service.worker_pool.stats())
}

#[derive(Debug, Deserialize)]
pub struct ListDlqQuery {
    pub limit: Option<usize>,
}

const DEFAULT_DLQ_LIST_LIMIT: usize = 100;

/// `GET /api/dlq?limit=` — list recent DLQ entries, newest first.
pub async fn list_dlq(
    State(service): State<PipelineService>,
    Query(query): Query<ListDlqQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(DEFAULT_DLQ_LIST_LIMIT).min(DEFAULT_DLQ_LIST_LIMIT);
    let entries = service.retry.list_dlq(limit).await.map_err(core_error_response)?;
    let data: Vec<serde_json::Value> = entries
        .into_iter()
        .map(|(id, fields)| serde_json::json!({"entry_id": id, "fields": fields}))
        .collect();
    Ok(Json(serde_json::json!({"count": data.len(), "entries": data})))
}

/// `POST /api/dlq/:entry_id/retry` — admin retry from DLQ (§4.6).
pub async fn retry_dlq(
    State(service): State<PipelineService>,
    Path(entry_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let retried = service.retry.retry_dlq_event(&entry_id).await.map_err(core_error_response)?;
    Ok(Json(serde_json::json!({"retried": retried, "entry_id": entry_id})))
}

/// `GET /api/streams/info` — per-stream length/group/first-last summary.
pub async fn stream_info(
    State(service): State<PipelineService>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let mut info = serde_json::Map::new();
    for stream in [
        crate::ingest::EVENTS_STREAM,
        crate::ingest::PROCESSED_STREAM,
        crate::ingest::DLQ_STREAM,
    ] {
        let stream_info = service.log.stream_info(stream).await.map_err(core_error_response)?;
        info.insert(stream.to_string(), serde_json::to_value(stream_info).unwrap());
    }
    Ok(Json(serde_json::Value::Object(info)))
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub client_id: Option<String>,
}

/// `GET /ws` — subscriber protocol upgrade (§4.7, §6). The socket is split
/// into two independent tasks: one forwarding hub broadcasts/alerts out,
/// one dispatching inbound frames through `BroadcastHub::handle_incoming`.
pub async fn websocket_upgrade(
    ws: WebSocketUpgrade,
    State(service): State<PipelineService>,
    Query(params): Query<ConnectParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, service, params.client_id))
}

async fn handle_socket(
    socket: axum::extract::ws::WebSocket,
    service: PipelineService,
    client_id: Option<String>,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let connection = service.broadcast.connect(client_id);
    let client_id = connection.client_id;
    let mut receiver = connection.receiver;
    let (mut sink, mut stream) = socket.split();

    let outbound_client_id = client_id.clone();
    let mut outbound = tokio::spawn(async move {
        while let Some(text) = receiver.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = outbound_client_id;
    });

    let hub = service.broadcast.clone();
    let inbound_client_id = client_id.clone();
    let mut inbound = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => hub.handle_incoming(&inbound_client_id, &text),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut outbound => inbound.abort(),
        _ = &mut inbound => outbound.abort(),
    }

    service.broadcast.disconnect(&client_id);
    warn!(client_id, "websocket session ended");
}

fn core_error_response(error: crate::error::CoreError) -> (StatusCode, String) {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, error.to_string())
}
