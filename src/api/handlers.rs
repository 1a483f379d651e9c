//! HTTP request handlers

use super::sse::{completion_stream, ChunkMeta};
use super::types::{
    completion_id, ChatCompletionRequest, ChatCompletionResponse, ErrorResponse, HealthResponse,
    UsageQuery, UsageRecordsResponse, UsageStatsResponse,
};
use super::AppState;
use crate::config::MODEL_ALIASES;
use crate::db::UsageFilter;
use crate::runner::{TurnError, TurnRequest};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const DEFAULT_USAGE_LIMIT: u32 = 100;
const MAX_USAGE_LIMIT: u32 = 1000;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // OpenAI-compatible completions, with and without the version prefix
        .route("/chat/completions", post(chat_completions))
        .route("/v1/chat/completions", post(chat_completions))
        // Usage accounting
        .route("/usage", get(list_usage))
        .route("/usage/stats", get(usage_stats))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ============================================================
// Chat Completions
// ============================================================

async fn chat_completions(
    State(state): State<AppState>,
    Json(payload): Json<ChatCompletionRequest>,
) -> Result<Response, AppError> {
    if payload.messages.is_empty() {
        return Err(AppError::BadRequest("messages cannot be empty".to_string()));
    }

    let model = payload
        .model
        .unwrap_or_else(|| state.default_model.clone());
    if !MODEL_ALIASES.contains(&model.as_str()) {
        return Err(AppError::BadRequest(format!(
            "unknown model '{model}', expected one of: {}",
            MODEL_ALIASES.join(", ")
        )));
    }

    let timeout = match payload.timeout {
        Some(0) => {
            return Err(AppError::BadRequest(
                "timeout must be at least one second".to_string(),
            ))
        }
        other => other.map(Duration::from_secs),
    };

    let id = completion_id();
    let created = chrono::Utc::now().timestamp();
    let request = TurnRequest {
        conversation_id: payload.conversation_id,
        model: model.clone(),
        messages: payload.messages,
        timeout,
        source: payload.source.unwrap_or_else(|| "unknown".to_string()),
        request_id: id.clone(),
    };

    // The turn runs in its own task; dropping the guard (client gone)
    // cancels it, which kills the process and frees the conversation.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let runner = Arc::clone(&state.runner);

    if payload.stream {
        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = runner.run_turn_streaming(request, cancel, delta_tx).await;
            let _ = outcome_tx.send(outcome);
        });
        let meta = ChunkMeta { id, created, model };
        return Ok(completion_stream(meta, delta_rx, outcome_rx, guard).into_response());
    }

    let result = tokio::spawn(async move { runner.run_turn(request, cancel).await })
        .await
        .map_err(|e| AppError::Internal(format!("turn task failed: {e}")))??;
    guard.disarm();

    Ok(Json(ChatCompletionResponse::new(id, created, model, result)).into_response())
}

// ============================================================
// Usage
// ============================================================

async fn list_usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<UsageRecordsResponse>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_USAGE_LIMIT)
        .min(MAX_USAGE_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let filter = UsageFilter {
        source: query.source,
        start_time: query.start_time,
        end_time: query.end_time,
    };

    let (records, total) = state
        .db
        .get_usage_records(&filter, limit, offset)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(UsageRecordsResponse {
        records,
        total,
        limit,
        offset,
    }))
}

async fn usage_stats(
    State(state): State<AppState>,
    Query(filter): Query<UsageFilter>,
) -> Result<Json<UsageStatsResponse>, AppError> {
    let stats = state
        .db
        .get_usage_stats(&filter)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(UsageStatsResponse { stats }))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Turn(e) => match e {
                TurnError::Timeout(_) | TurnError::LockTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
                TurnError::ToolReportedFailure(_)
                | TurnError::MalformedTerminalOutput(_)
                | TurnError::ProcessFailed { .. } => StatusCode::BAD_GATEWAY,
                // Nobody reads this; the client already left
                TurnError::Cancelled => {
                    StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }
                TurnError::LaunchFailure(_) | TurnError::Store(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorResponse::new(self.to_string()));
        (status, body).into_response()
    }
}
