use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use garde::Validate;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::job::RunOptions;
use crate::services::runner::RunnerCommand;

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub accepted: bool,
}

/// POST /api/v1/run/start — begin a run from the top of the queue.
pub async fn start_run(
    State(state): State<AppState>,
    Json(options): Json<RunOptions>,
) -> Result<(StatusCode, Json<ControlResponse>), StatusCode> {
    options.validate().map_err(|_| StatusCode::BAD_REQUEST)?;

    let empty = {
        let jobs = state.jobs.read().await;
        jobs.items.is_empty()
    };
    if empty {
        return Err(StatusCode::CONFLICT);
    }

    if !state.runner.send(RunnerCommand::Start(options)).await {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok((StatusCode::ACCEPTED, Json(ControlResponse { accepted: true })))
}

/// POST /api/v1/run/pause — toggle the paused flag.
pub async fn toggle_pause(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ControlResponse>), StatusCode> {
    if !state.runner.send(RunnerCommand::TogglePause).await {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok((StatusCode::ACCEPTED, Json(ControlResponse { accepted: true })))
}

/// POST /api/v1/run/cancel — stop processing and tear down in-flight work.
pub async fn cancel_run(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ControlResponse>), StatusCode> {
    if !state.runner.send(RunnerCommand::Cancel).await {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok((StatusCode::ACCEPTED, Json(ControlResponse { accepted: true })))
}

/// GET /api/v1/report — plain-text completion report, one line per item.
pub async fn report(State(state): State<AppState>) -> impl IntoResponse {
    let body = {
        let jobs = state.jobs.read().await;
        jobs.completion_report()
    };
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
}
