//! Read endpoints and inbound event ingestion.
//!
//! Grounded on `backend/src/api/http/health.rs`'s handler shape
//! (`State(state): State<AppState>`, a small response struct, `Json`) and
//! `backend/src/api/http/mod.rs`'s flat re-export style; request/response
//! contracts here are binding, the routing around them is not.

use std::sync::atomic::Ordering;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::broadcast::LiveEvent;
use crate::error::{ApiError, ApiResult, IntoApiError};
use crate::metrics::Granularity;
use crate::model::{NewPendingMessage, PendingKind, UserPrompt};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TokenFilterParams {
    pub project: Option<String>,
    pub since: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ByProjectParams {
    pub limit: Option<i64>,
    pub since: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TimeSeriesParams {
    pub project: Option<String>,
    pub since: Option<String>,
    pub granularity: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProjectionParams {
    pub project: String,
    #[serde(rename = "observationCount")]
    pub observation_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SinceParams {
    pub since: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PerfTimesParams {
    pub since: Option<String>,
    pub limit: Option<usize>,
}

fn since_to_epoch_ms(since: Option<&str>) -> Option<i64> {
    since.and_then(|s| crate::metrics::parse_since(s, chrono::Utc::now()))
}

pub async fn tokens_summary(
    State(state): State<AppState>,
    Query(params): Query<TokenFilterParams>,
) -> Json<serde_json::Value> {
    let summary = state
        .metrics
        .summary(params.project.as_deref(), params.since.as_deref())
        .await;
    Json(serde_json::to_value(summary).unwrap_or(json!({})))
}

pub async fn tokens_by_project(
    State(state): State<AppState>,
    Query(params): Query<ByProjectParams>,
) -> Json<serde_json::Value> {
    let result = state
        .metrics
        .by_project(params.limit.unwrap_or(10), params.since.as_deref())
        .await;
    Json(serde_json::to_value(result).unwrap_or(json!({})))
}

pub async fn tokens_by_type(
    State(state): State<AppState>,
    Query(params): Query<TokenFilterParams>,
) -> Json<serde_json::Value> {
    let rows = state
        .metrics
        .by_type(params.project.as_deref(), params.since.as_deref())
        .await;
    Json(serde_json::to_value(rows).unwrap_or(json!([])))
}

pub async fn tokens_time_series(
    State(state): State<AppState>,
    Query(params): Query<TimeSeriesParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let granularity = Granularity::parse(params.granularity.as_deref().unwrap_or("day"))
        .ok_or_else(|| ApiError::bad_request("granularity must be hour, day, or week"))?;
    let rows = state
        .metrics
        .time_series(params.project.as_deref(), params.since.as_deref(), granularity)
        .await;
    Ok(Json(serde_json::to_value(rows).unwrap_or(json!([]))))
}

pub async fn tokens_compression(
    State(state): State<AppState>,
    Query(params): Query<TokenFilterParams>,
) -> Json<serde_json::Value> {
    let result = state
        .metrics
        .compression(params.project.as_deref(), params.since.as_deref())
        .await;
    Json(serde_json::to_value(result).unwrap_or(json!({})))
}

pub async fn tokens_projection(
    State(state): State<AppState>,
    Query(params): Query<ProjectionParams>,
) -> Json<serde_json::Value> {
    let projection = state
        .metrics
        .projection(&params.project, params.observation_count.unwrap_or(50))
        .await;
    Json(serde_json::to_value(projection).unwrap_or(json!({})))
}

pub async fn performance_queue(
    State(state): State<AppState>,
    Query(params): Query<SinceParams>,
) -> Json<serde_json::Value> {
    let since_ms = since_to_epoch_ms(params.since.as_deref());
    let history = state.perf.get_queue_history(since_ms);
    let rows: Vec<serde_json::Value> = history
        .iter()
        .map(|s| json!({ "timestampMs": s.timestamp_ms, "depth": s.depth }))
        .collect();
    Json(json!(rows))
}

pub async fn performance_times(
    State(state): State<AppState>,
    Query(params): Query<PerfTimesParams>,
) -> Json<serde_json::Value> {
    let since_ms = since_to_epoch_ms(params.since.as_deref());
    let stats = state.perf.get_processing_times(since_ms, params.limit);
    Json(serde_json::to_value(stats).unwrap_or(json!({})))
}

/// Wire shape for `{ sessionId, project, userPrompt?, kind, toolName?,
/// toolInput?, toolResponse?, cwd?, lastUserMessage?, lastAssistantMessage? }`.
/// Unknown fields are ignored because this struct simply doesn't declare them.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub session_id: String,
    pub project: String,
    pub user_prompt: Option<String>,
    pub kind: String,
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub tool_response: Option<serde_json::Value>,
    pub cwd: Option<String>,
    pub last_user_message: Option<String>,
    pub last_assistant_message: Option<String>,
}

pub async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> ApiResult<Json<serde_json::Value>> {
    let kind = PendingKind::from_str(&event.kind)
        .ok_or_else(|| ApiError::bad_request("kind must be \"observation\" or \"summarize\""))?;

    let was_active = state.sessions.is_active(&event.session_id);
    let active = state
        .sessions
        .initialize_session(&event.session_id, &event.project, event.user_prompt.as_deref())
        .await
        .into_api_error("failed to initialize session")?;

    let mut prompt_number = None;
    if let Some(text) = &event.user_prompt {
        let number = if was_active {
            active.prompt_number.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            active.prompt_number.load(Ordering::Relaxed)
        };
        let (id, created_at) = state
            .store
            .insert_prompt(&event.session_id, &event.project, number, text)
            .await
            .into_api_error("failed to record user prompt")?;
        state.broadcaster.publish(LiveEvent::NewPrompt {
            prompt: UserPrompt {
                id,
                assistant_session_id: event.session_id.clone(),
                project: event.project.clone(),
                prompt_number: number,
                prompt_text: text.clone(),
                created_at_epoch: created_at,
            },
        });
        prompt_number = Some(number);
    }

    let msg = NewPendingMessage {
        kind,
        tool_name: event.tool_name,
        tool_input: event.tool_input.map(|v| v.to_string()),
        tool_response: event.tool_response.map(|v| v.to_string()),
        cwd: event.cwd,
        prompt_number,
        last_user_message: event.last_user_message,
        last_assistant_message: event.last_assistant_message,
    };

    state
        .sessions
        .enqueue(active.session_id, msg)
        .await
        .into_api_error("failed to enqueue pending message")?;

    Ok(Json(json!({ "accepted": true, "sessionId": active.session_id })))
}
