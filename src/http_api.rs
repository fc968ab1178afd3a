// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router};
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use canonical_error::{CanonicalError, CanonicalErrorCode, invalid_argument_error};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use tower_http::{services::ServeDir, cors::AllowOrigin, cors::Any, cors::CorsLayer};

use crate::detection::FrameResult;
use crate::detector_trait::{DetectorKind, DetectorTrait};
use crate::frame_source::{ChannelFrameSource, decode_frame, decode_framed_message};
use crate::pipeline::FramePipeline;
use crate::pipeline_registry::{PipelineRegistry, UPLOAD_PIPELINE_ID};
use crate::rate_limiter::RateLimiter;
use crate::relay::RelayRegistry;
use crate::telemetry::{Summary, TelemetryAggregator, TelemetrySample};

const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_SUMMARY_WINDOW_SECS: u64 = 30;
const DEFAULT_ROOM: &str = "default";
const DEFAULT_LONG_POLL_MS: u64 = 5_000;
const MAX_LONG_POLL_MS: u64 = 60_000;

#[derive(Clone, Debug)]
pub struct ServerSettings {
    // Upper bound on frames per second for each streaming pipeline.
    pub max_rate_hz: f64,

    pub telemetry_capacity: usize,

    // Capacity of the inference latency "recent" window per pipeline.
    pub stats_capacity: usize,

    // Outbound queue depth for pushing results to a streaming client. A
    // client that falls behind misses results rather than queueing them.
    pub listener_capacity: usize,

    // Whether pipelines feed derived samples into the telemetry buffer, in
    // addition to client-reported samples.
    pub pipeline_telemetry: bool,

    // Outbound queue depth per relay member.
    pub relay_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings{
            max_rate_hz: 15.0,
            telemetry_capacity: crate::telemetry::DEFAULT_CAPACITY,
            stats_capacity: 100,
            listener_capacity: 1,
            pipeline_telemetry: true,
            relay_capacity: 64,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub mode: DetectorKind,
    pub settings: ServerSettings,
    pub detector: Arc<dyn DetectorTrait + Send + Sync>,
    pub telemetry: Arc<TelemetryAggregator>,
    pub registry: Arc<PipelineRegistry>,
    pub relay: Arc<RelayRegistry>,

    // Serves synchronous submissions. The lock serializes them, which keeps
    // this pipeline's slot single-writer.
    upload_pipeline: Arc<tokio::sync::Mutex<FramePipeline>>,
}

impl AppState {
    pub fn new(mode: DetectorKind,
               detector: Arc<dyn DetectorTrait + Send + Sync>,
               settings: ServerSettings) -> Self {
        let telemetry = Arc::new(TelemetryAggregator::new(settings.telemetry_capacity));
        let registry = Arc::new(PipelineRegistry::new());
        let upload_pipeline = FramePipeline::new(
            UPLOAD_PIPELINE_ID, detector.clone(),
            settings.pipeline_telemetry.then(|| telemetry.clone()),
            RateLimiter::unlimited(), settings.stats_capacity);
        registry.register(upload_pipeline.handle());
        AppState{
            mode,
            relay: Arc::new(RelayRegistry::new(settings.relay_capacity)),
            settings,
            detector,
            telemetry,
            registry,
            upload_pipeline: Arc::new(tokio::sync::Mutex::new(upload_pipeline)),
        }
    }

    fn pipeline_telemetry(&self) -> Option<Arc<TelemetryAggregator>> {
        self.settings.pipeline_telemetry.then(|| self.telemetry.clone())
    }
}

pub fn http_status(code: CanonicalErrorCode) -> StatusCode {
    match code {
        CanonicalErrorCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        CanonicalErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        CanonicalErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        CanonicalErrorCode::NotFound => StatusCode::NOT_FOUND,
        CanonicalErrorCode::AlreadyExists => StatusCode::CONFLICT,
        CanonicalErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        CanonicalErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
        CanonicalErrorCode::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        CanonicalErrorCode::FailedPrecondition => StatusCode::BAD_REQUEST,
        CanonicalErrorCode::Aborted => StatusCode::CONFLICT,
        CanonicalErrorCode::OutOfRange => StatusCode::BAD_REQUEST,
        CanonicalErrorCode::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        CanonicalErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        CanonicalErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        CanonicalErrorCode::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub struct ApiError(pub CanonicalError);

impl From<CanonicalError> for ApiError {
    fn from(error: CanonicalError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (http_status(self.0.code), Json(json!({"error": self.0.message})))
            .into_response()
    }
}

/// Any origin when `origins` is empty or contains "*".
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    let origins: Vec<&str> = origins.iter()
        .map(|o| o.trim())
        .filter(|o| !o.is_empty())
        .collect();
    if origins.is_empty() || origins.contains(&"*") {
        return layer.allow_origin(Any);
    }
    let values: Vec<HeaderValue> = origins.iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(values))
}

pub fn router(state: AppState, cors: CorsLayer, static_dir: Option<PathBuf>) -> Router {
    let mut router = Router::new()
        .route("/", get(status))
        .route("/latest", get(latest))
        .route("/infer", post(infer))
        .route("/metrics/ingest", post(metrics_ingest))
        .route("/metrics/summary", get(metrics_summary))
        .route("/metrics/stats", get(metrics_stats))
        .route("/metrics/stats/reset", post(reset_stats))
        .route("/stream", get(stream))
        .route("/ws", get(relay))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state);
    if let Some(static_dir) = static_dir {
        router = router.fallback_service(ServeDir::new(static_dir));
    }
    router.layer(cors)
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "mode": state.mode.as_str()}))
}

#[derive(Debug, Deserialize)]
struct LatestParams {
    pipeline_id: Option<u64>,

    // When present, wait (up to `timeout_ms`) for a result with a different
    // frame_id before answering.
    prev_frame_id: Option<i64>,
    timeout_ms: Option<u64>,
}

async fn latest(State(state): State<AppState>,
                Query(params): Query<LatestParams>) -> Json<FrameResult> {
    let id = params.pipeline_id.unwrap_or(UPLOAD_PIPELINE_ID);
    let (prev_frame_id, handle) = match (params.prev_frame_id, state.registry.get(id)) {
        (Some(prev_frame_id), Some(handle)) => (prev_frame_id, handle),
        _ => return Json(state.registry.latest(id)),
    };
    let timeout = Duration::from_millis(
        params.timeout_ms.unwrap_or(DEFAULT_LONG_POLL_MS).min(MAX_LONG_POLL_MS));
    match tokio::time::timeout(timeout, handle.next_result(prev_frame_id)).await {
        Ok(result) => Json(result),
        Err(_) => Json(handle.latest()),
    }
}

fn parse_field(name: &str, value: Option<String>) -> Result<i64, CanonicalError> {
    let value = value.ok_or_else(
        || invalid_argument_error(&format!("missing '{}' field", name)))?;
    value.trim().parse::<i64>().map_err(
        |_| invalid_argument_error(&format!("'{}' is not an integer: {:?}", name, value)))
}

fn multipart_error(e: impl std::fmt::Display) -> CanonicalError {
    invalid_argument_error(&format!("malformed multipart body: {}", e))
}

// Runs one uploaded frame through the detector and publishes it, returning
// the result directly.
async fn infer(State(state): State<AppState>,
               mut multipart: Multipart) -> Result<Json<FrameResult>, ApiError> {
    let mut image: Option<Vec<u8>> = None;
    let mut frame_id: Option<String> = None;
    let mut capture_ts: Option<String> = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "image" => {
                image = Some(field.bytes().await.map_err(multipart_error)?.to_vec());
            },
            "frame_id" => {
                frame_id = Some(field.text().await.map_err(multipart_error)?);
            },
            "capture_ts" => {
                capture_ts = Some(field.text().await.map_err(multipart_error)?);
            },
            other => debug!("Ignoring multipart field {:?}", other),
        }
    }
    let image = image.ok_or_else(|| invalid_argument_error("missing 'image' field"))?;
    let frame_id = parse_field("frame_id", frame_id)?;
    let capture_ts = parse_field("capture_ts", capture_ts)?;
    let frame = decode_frame(&image, capture_ts)?;

    let mut pipeline = state.upload_pipeline.lock().await;
    Ok(Json(pipeline.process_submitted(frame, frame_id).await))
}

async fn metrics_ingest(State(state): State<AppState>,
                        Json(sample): Json<TelemetrySample>) -> Json<serde_json::Value> {
    state.telemetry.ingest(sample);
    Json(json!({"ok": true}))
}

#[derive(Debug, Deserialize)]
struct SummaryParams {
    // Window length in seconds.
    duration: Option<u64>,
}

async fn metrics_summary(State(state): State<AppState>,
                         Query(params): Query<SummaryParams>) -> Json<Summary> {
    let window = params.duration.unwrap_or(DEFAULT_SUMMARY_WINDOW_SECS);
    Json(state.telemetry.summarize(window))
}

async fn metrics_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "telemetry": state.telemetry.stats(),
        "pipelines": state.registry.stats(),
        "relay_groups": state.relay.group_count(),
    }))
}

// Clears session-wide stats of every pipeline. Telemetry samples are kept.
async fn reset_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.registry.reset_session_stats();
    Json(json!({"ok": true}))
}

async fn stream(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_connection(socket, state))
}

// One pipeline per connection. Inbound binary messages are frames (see
// decode_framed_message()); results go back as JSON text, latest first: a
// client that reads slowly skips results.
async fn stream_connection(socket: WebSocket, state: AppState) {
    let id = state.registry.allocate_id();
    let pipeline = FramePipeline::new(
        id, state.detector.clone(), state.pipeline_telemetry(),
        RateLimiter::new(state.settings.max_rate_hz),
        state.settings.stats_capacity);
    let handle = pipeline.handle();
    state.registry.register(handle.clone());
    let mut results = handle.reader().subscribe(state.settings.listener_capacity);

    // Room for one frame while the pipeline is busy; anything beyond that is
    // dropped instead of stalling the socket.
    let (frame_sender, source) = ChannelFrameSource::new(1);
    let pipeline_task = tokio::spawn(pipeline.run(source));

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(result) = results.recv().await {
            let text = match serde_json::to_string(&*result) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Could not serialize frame result: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    info!("Stream client connected as pipeline {}", id);
    while let Some(Ok(message)) = ws_receiver.next().await {
        match message {
            Message::Binary(data) => match decode_framed_message(&data) {
                Ok(frame) => {
                    if frame_sender.try_send(frame).is_err() {
                        handle.record_dropped_frame();
                    }
                },
                Err(e) => warn!("Pipeline {} ignoring bad frame: {}", id, e.message),
            },
            Message::Close(_) => break,
            _ => (),
        }
    }

    // Ending the source ends the pipeline, which closes `results`.
    drop(frame_sender);
    if let Err(e) = pipeline_task.await {
        warn!("Pipeline {} task failed: {}", id, e);
    }
    let _ = send_task.await;
    state.registry.remove(id);
    info!("Stream client for pipeline {} disconnected; {} frames dropped",
          id, handle.stats().frames_dropped);
}

#[derive(Debug, Deserialize)]
struct RelayParams {
    room: Option<String>,
}

async fn relay(State(state): State<AppState>,
               Query(params): Query<RelayParams>,
               ws: WebSocketUpgrade) -> Response {
    let room = params.room.unwrap_or_else(|| DEFAULT_ROOM.to_string());
    ws.on_upgrade(move |socket| relay_connection(socket, state, room))
}

async fn relay_connection(socket: WebSocket, state: AppState, room: String) {
    let mut member = state.relay.join(&room);
    let member_id = member.id;
    debug!("Relay member {} joined room {:?}, now {} members",
           member_id, room, state.relay.member_count(&room));
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let forward_task = tokio::spawn(async move {
        while let Some(text) = member.receiver.recv().await {
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });
    while let Some(Ok(message)) = ws_receiver.next().await {
        match message {
            Message::Text(text) => {
                state.relay.broadcast(&room, member_id, &text);
            },
            Message::Close(_) => break,
            _ => (),
        }
    }
    state.relay.leave(&room, member_id);
    forward_task.abort();
}

// mod tests.
