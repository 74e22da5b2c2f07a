//! Control surface routes and middleware

use std::convert::Infallible;
use std::path::PathBuf;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::server::ApiState;
use crate::core::types::{Event, Label};
use crate::core::utils::normalize_path;
use crate::service::{MonitoredFile, MonitoringStatus};
use crate::tag::{PathQuery, TagOutcome, TreeOutcome, UntagOutcome};

pub const DEFAULT_EVENTS_LIMIT: usize = 100;
const MAX_EVENTS_LIMIT: usize = 10_000;

/// Answer of the start/stop routes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
}

impl ControlResponse {
    fn new(success: bool, message: impl Into<String>) -> Self {
        Self {
            success,
            message: message.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PathParams {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct TagRequest {
    pub path: PathBuf,
    pub label: String,
}

impl TagRequest {
    fn parse(self) -> Result<(PathBuf, Label), ApiError> {
        let label = self
            .label
            .parse::<Label>()
            .map_err(|e| ApiError::BadRequest { reason: e.to_string() })?;
        Ok((normalize_path(&self.path), label))
    }
}

/// Token check and response hardening
///
/// The token may arrive as `Authorization: Bearer <token>` or in the
/// `X-Session-Token` header. `/health` is always open.
pub async fn security_middleware(
    State(state): State<ApiState>,
    headers: HeaderMap,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if request.uri().path() != "/health" && state.requires_token() {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .or_else(|| headers.get("X-Session-Token").and_then(|v| v.to_str().ok()));

        match token {
            Some(t) if state.validate_token(t.trim()) => {}
            _ => {
                tracing::warn!(path = %request.uri().path(), "Rejected request without a valid token");
                return Err(ApiError::InvalidToken);
            }
        }
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    if !headers.contains_key(header::CACHE_CONTROL) {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }

    Ok(response)
}

/// Route: GET /api/monitoring/status
pub async fn get_status(State(state): State<ApiState>) -> Json<MonitoringStatus> {
    Json(state.controller.get_status().await)
}

/// Route: POST /api/monitoring/start
pub async fn start_monitoring(State(state): State<ApiState>) -> impl IntoResponse {
    match state.controller.start().await {
        Ok(true) => (
            StatusCode::OK,
            Json(ControlResponse::new(true, "Monitoring started")),
        ),
        Ok(false) => (
            StatusCode::OK,
            Json(ControlResponse::new(false, "Monitoring already active")),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Could not start monitoring");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ControlResponse::new(false, e.to_string())),
            )
        }
    }
}

/// Route: POST /api/monitoring/stop
pub async fn stop_monitoring(State(state): State<ApiState>) -> Json<ControlResponse> {
    if state.controller.stop().await {
        Json(ControlResponse::new(true, "Monitoring stopped"))
    } else {
        Json(ControlResponse::new(false, "Monitoring not active"))
    }
}

/// Route: GET /api/monitored_files
pub async fn list_monitored_files(
    State(state): State<ApiState>,
) -> Result<Json<Vec<MonitoredFile>>, ApiError> {
    Ok(Json(state.controller.list_monitored_files().await?))
}

/// Route: GET /api/events?limit=N
pub async fn list_events(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENTS_LIMIT)
        .min(MAX_EVENTS_LIMIT);
    Ok(Json(state.controller.list_recent_events(limit).await?))
}

/// Route: GET /api/events/stream
///
/// One `file_event` per published event. A client that falls behind skips
/// the events it missed.
pub async fn events_stream(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let events = state
        .controller
        .subscribe_events()
        .into_stream()
        .filter_map(|event| async move {
            match SseEvent::default().event("file_event").json_data(&event) {
                Ok(frame) => Some(Ok(frame)),
                Err(e) => {
                    tracing::warn!(error = %e, event_id = event.id, "Could not encode event");
                    None
                }
            }
        });

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Route: POST /api/tags
pub async fn tag_path(
    State(state): State<ApiState>,
    Json(request): Json<TagRequest>,
) -> Result<Json<TagOutcome>, ApiError> {
    let (path, label) = request.parse()?;
    Ok(Json(state.tagging.tag_path(&path, &label).await?))
}

/// Route: DELETE /api/tags
pub async fn untag_path(
    State(state): State<ApiState>,
    Json(params): Json<PathParams>,
) -> Result<Json<UntagOutcome>, ApiError> {
    let path = normalize_path(&params.path);
    Ok(Json(state.tagging.untag_path(&path).await?))
}

/// Route: GET /api/tags?path=
pub async fn query_tag(
    State(state): State<ApiState>,
    Query(params): Query<PathParams>,
) -> Result<Json<PathQuery>, ApiError> {
    let path = normalize_path(&params.path);
    Ok(Json(state.tagging.query_path(&path).await?))
}

/// Route: POST /api/tags/tree
pub async fn tag_tree(
    State(state): State<ApiState>,
    Json(request): Json<TagRequest>,
) -> Result<Json<TreeOutcome>, ApiError> {
    let (path, label) = request.parse()?;
    Ok(Json(
        state.tagging.tag_tree_recursive(&path, &label, None).await?,
    ))
}
