use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Request, State, WebSocketUpgrade,
    },
    http::{header, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{future, SinkExt, StreamExt};
use llm_core::History;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tts_core::ArtifactStats;

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::metrics::{DetailedMetricsResponse, SystemMetrics};
use crate::protocol::{Inbound, ServerEvent};
use crate::session::{new_session_id, SessionOrchestrator};
use crate::state::AppState;
use crate::validation::{validate_artifact_id, validate_ask_request, validate_session_id};

/// Outbound events buffered per connection before the session waits on
/// the socket.
const OUTBOUND_BUFFER: usize = 64;

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// The full application: routes at the root and under `/api`, wrapped in
/// tracing, rate limiting, timeouts and CORS.
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let _ = START_TIME.get_or_init(Instant::now);
    let config = &state.config;

    let cors = cors_layer(config);

    // Global limit: every client shares one bucket.
    let per_minute = config.rate_limit_per_minute.max(1);
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond(u64::from(60_000 / per_minute).max(1))
            .burst_size(per_minute)
            .key_extractor(GlobalKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limit configuration"))?,
    );
    info!("Rate limiting: {} requests per minute", per_minute);

    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer::new(governor_conf))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(cors)
        .into_inner();

    let api = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .route("/healthz", get(health_check))
        .route("/artifact/{artifact_id}", get(get_artifact).delete(delete_artifact))
        .route("/audio/{artifact_id}", get(get_artifact))
        .route("/artifacts/stats", get(artifact_stats))
        .route("/session/{session_id}/terminate", post(terminate_session))
        .route("/cleanup_session/{session_id}", post(terminate_session))
        .route("/ask", post(ask_endpoint))
        .route("/metrics", get(metrics_endpoint));

    Ok(Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .layer(axum::middleware::from_fn(add_request_id))
        .layer(middleware_stack)
        .with_state(state))
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .allow_credentials(false);

    let Some(allowed) = &config.cors_allowed_origins else {
        warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
        return base.allow_origin(Any);
    };

    let origins: Vec<HeaderValue> = allowed
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();
    if origins.is_empty() {
        warn!("CORS_ALLOWED_ORIGINS is empty, falling back to permissive CORS");
        return base.allow_origin(Any);
    }
    info!("CORS configured for {} origin(s)", origins.len());
    base.allow_origin(AllowOrigin::list(origins))
}

async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let header_value = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = &header_value {
        request.headers_mut().insert("x-request-id", value.clone());
    }
    let mut response = next.run(request).await;
    if let Some(value) = header_value {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    ws.on_upgrade(move |socket| run_socket(socket, state))
}

async fn run_socket(socket: WebSocket, state: AppState) {
    let session_id = new_session_id();
    let shutdown = state.registry.register(&session_id);
    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to encode server event: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let inbound = stream
        .take_while(|message| {
            future::ready(matches!(message, Ok(m) if !matches!(m, Message::Close(_))))
        })
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Binary(bytes)) => Some(Inbound::Audio(bytes.to_vec())),
                Ok(Message::Text(text)) => Some(Inbound::Text(text.as_str().to_owned())),
                _ => None,
            })
        });

    SessionOrchestrator::new(session_id.clone(), state.services.clone(), tx, shutdown)
        .run(inbound)
        .await;
    state.registry.remove(&session_id);

    if let Err(e) = writer.await {
        warn!(session_id = %session_id, "WebSocket writer ended abnormally: {e}");
    }
}

fn content_type_for(artifact_id: &str) -> &'static str {
    match artifact_id.rsplit_once('.').map(|(_, ext)| ext) {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

pub async fn get_artifact(
    State(state): State<AppState>,
    Path(artifact_id): Path<String>,
) -> Result<Response, ApiError> {
    validate_artifact_id(&artifact_id)?;
    let bytes = state
        .services
        .store
        .read(&artifact_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Artifact not found: {artifact_id}")))?;
    Ok(([(header::CONTENT_TYPE, content_type_for(&artifact_id))], bytes).into_response())
}

#[derive(Serialize)]
pub struct MessageResponse {
    message: String,
}

pub async fn delete_artifact(
    State(state): State<AppState>,
    Path(artifact_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    validate_artifact_id(&artifact_id)?;
    if !state.services.store.delete(&artifact_id).await {
        return Err(ApiError::NotFound(format!("Artifact not found: {artifact_id}")));
    }
    Ok(Json(MessageResponse {
        message: format!("Artifact {artifact_id} deleted"),
    }))
}

#[derive(Serialize)]
pub struct TerminateResponse {
    session_id: String,
    terminated: bool,
    deleted: usize,
}

pub async fn terminate_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<TerminateResponse>, ApiError> {
    validate_session_id(&session_id)?;
    let terminated = state.registry.terminate(&session_id);
    let deleted = state.services.store.cleanup_session(&session_id).await;
    info!(session_id = %session_id, terminated, deleted, "session cleanup requested");
    Ok(Json(TerminateResponse {
        session_id,
        terminated,
        deleted,
    }))
}

pub async fn artifact_stats(State(state): State<AppState>) -> Json<ArtifactStats> {
    Json(state.services.store.stats().await)
}

#[derive(Deserialize)]
pub struct AskRequest {
    #[serde(rename = "userText")]
    user_text: Option<String>,
    #[serde(rename = "systemContent")]
    system_content: Option<String>,
    #[serde(default)]
    is_initial: bool,
}

#[derive(Serialize)]
pub struct AskResponse {
    answer: String,
    audio_url: Option<String>,
}

pub async fn ask_endpoint(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let start_time = Instant::now();

    validate_ask_request(req.user_text.as_deref(), req.system_content.as_deref())?;
    let user_text = req.user_text.unwrap_or_default().trim().to_string();
    let system_prompt = req.system_content.unwrap_or_default();

    let answer = if req.is_initial {
        user_text
    } else {
        let mut history = History::new(state.services.history_cap);
        state
            .services
            .responder
            .reply(&user_text, &system_prompt, &mut history)
            .await
    };

    let session_id = format!("api_session_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let audio_url = match state.services.chunker.render(&session_id, &answer).await {
        Ok(Some(artifact_id)) => Some(state.services.artifact_url(&artifact_id)),
        Ok(None) => None,
        Err(e) => {
            error!(session_id = %session_id, "Synthesis for ask request failed: {e:#}");
            None
        }
    };

    info!(
        "Ask answered in {:.2}s, answer length={}, audio={}",
        start_time.elapsed().as_secs_f64(),
        answer.chars().count(),
        audio_url.is_some()
    );
    Ok(Json(AskResponse { answer, audio_url }))
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<DetailedMetricsResponse> {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();

    let cpu_usage = system.global_cpu_info().cpu_usage();
    let memory_used = system.used_memory();
    let memory_total = system.total_memory();
    let memory_usage_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);

    // Unix-like systems only
    let system_load = {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/proc/loadavg")
                .ok()
                .and_then(|loadavg| loadavg.split_whitespace().next()?.parse::<f64>().ok())
        }
        #[cfg(not(unix))]
        None
    };

    let metrics = &state.services.metrics;
    Json(DetailedMetricsResponse {
        timestamp: chrono::Utc::now(),
        system: SystemMetrics {
            cpu_usage_percent: cpu_usage,
            memory_used_mb: memory_used / 1024 / 1024,
            memory_total_mb: memory_total / 1024 / 1024,
            memory_usage_percent,
            request_count: state.request_count.load(Ordering::Relaxed),
            uptime_seconds: uptime,
            system_load,
        },
        sessions: metrics.sessions(),
        synthesis: metrics.synthesis.snapshot(),
        artifacts: state.services.store.stats().await,
    })
}
