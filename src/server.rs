use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::keys::KeyPool;
use crate::logging::AuditLog;
use crate::proxy::{DispatchOutput, Dispatcher};
use crate::routing::StaticRouter;
use crate::translate::Format;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub dispatcher: Dispatcher,
    pub keys: Arc<KeyPool>,
    pub audit: Arc<AuditLog>,
}

impl AppState {
    /// Wire the in-process router, key pool and audit log into a dispatcher.
    pub fn from_config(config: ProxyConfig, audit: AuditLog) -> crate::Result<Self> {
        let config = Arc::new(config);
        let keys = Arc::new(KeyPool::from_config(&config)?);
        let audit = Arc::new(audit);
        let router = Arc::new(StaticRouter::from_config(&config));
        let dispatcher = Dispatcher::new(config.clone(), router, keys.clone(), audit.clone())?;
        Ok(Self {
            config,
            dispatcher,
            keys,
            audit,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(handle_openai))
        .route("/v1/anthropic/completions", post(handle_claude))
        .route("/v1/messages", post(handle_claude))
        .route("/v1/gemini/completions", post(handle_gemini))
        .route("/health", get(handle_health))
        .route("/v1/models", get(handle_models))
        .route("/v1/keys/stats", get(handle_key_stats))
        .route("/v1/audit/recent", get(handle_audit_recent))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_openai(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    dispatch(&state, Format::OpenAi, body).await
}

async fn handle_claude(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    dispatch(&state, Format::Claude, body).await
}

async fn handle_gemini(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    dispatch(&state, Format::Gemini, body).await
}

async fn dispatch(state: &AppState, source: Format, body: Bytes) -> Response {
    match state.dispatcher.handle(source, body).await {
        Ok(DispatchOutput::Json(value)) => Json(value).into_response(),
        Ok(DispatchOutput::Stream(frames)) => {
            let bytes = frames.map(|frame| Ok::<_, Infallible>(Bytes::from(frame.render())));
            sse_response("text/event-stream", Body::from_stream(bytes))
        }
        Ok(DispatchOutput::Raw { content_type, body }) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Ok(DispatchOutput::RawStream { content_type, body }) => {
            sse_response(&content_type, Body::from_stream(body))
        }
        Err(e) => error_response(source, &e),
    }
}

fn sse_response(content_type: &str, body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Render `err` in the envelope of the format the client speaks.
pub fn error_response(source: Format, err: &ProxyError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
    if status.is_server_error() {
        tracing::error!(source = %source, status = status.as_u16(), error = %err, "request failed");
    } else {
        tracing::warn!(source = %source, status = status.as_u16(), error = %err, "request rejected");
    }
    (status, Json(source.codec().error_body(err))).into_response()
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let models: Vec<serde_json::Value> = state
        .config
        .routes
        .iter()
        .filter(|r| r.enabled)
        .map(|route| {
            serde_json::json!({
                "id": route.route_key,
                "object": "model",
                "owned_by": route.provider,
            })
        })
        .collect();

    Json(serde_json::json!({ "data": models, "object": "list" }))
}

async fn handle_key_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "keys": state.keys.stats() }))
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn handle_audit_recent(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(50).min(1000);
    Json(serde_json::json!({ "records": state.audit.recent(limit) }))
}
