use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use base64::Engine;
use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::{ItemMeta, RunStats};

/// POST /api/v1/images — add source images to the queue.
#[derive(Debug, Deserialize, Validate)]
pub struct AddImagesRequest {
    #[garde(length(min = 1, max = 500), dive)]
    pub images: Vec<NewImage>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct NewImage {
    #[garde(length(min = 1, max = 200))]
    pub name: String,

    /// Base64 payload, optionally a full `data:` URL.
    #[garde(length(min = 1))]
    pub data: String,
}

#[derive(Debug, Serialize)]
pub struct AddImagesResponse {
    pub added: usize,
    pub ids: Vec<Uuid>,
}

/// Lightweight state view: metadata only, payload bytes never leave the
/// store through this endpoint.
#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub items: Vec<ItemMeta>,
    pub cursor: usize,
    pub processing: bool,
    pub paused: bool,
    pub stats: RunStats,
    pub started_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub stuck: bool,
    pub stuck_since: Option<DateTime<Utc>>,
    pub pause_until: Option<DateTime<Utc>>,
}

pub async fn add_images(
    State(state): State<AppState>,
    Json(request): Json<AddImagesRequest>,
) -> Result<Json<AddImagesResponse>, StatusCode> {
    request.validate().map_err(|_| StatusCode::BAD_REQUEST)?;

    let mut ids = Vec::with_capacity(request.images.len());
    for img in &request.images {
        let bytes = decode_payload(&img.data).ok_or(StatusCode::BAD_REQUEST)?;
        let format =
            image::guess_format(&bytes).map_err(|_| StatusCode::UNSUPPORTED_MEDIA_TYPE)?;

        let id = Uuid::new_v4();
        state
            .store
            .put(id, &bytes, format.to_mime_type())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to store image payload");
                StatusCode::BAD_GATEWAY
            })?;

        {
            let mut jobs = state.jobs.write().await;
            jobs.push_item(id, img.name.clone());
        }
        ids.push(id);
    }

    state.persist_jobs().await;
    tracing::info!(count = ids.len(), "images added to queue");

    Ok(Json(AddImagesResponse {
        added: ids.len(),
        ids,
    }))
}

/// DELETE /api/v1/images/:id — remove one item from queue and store.
/// Rejected while a run is active: completions are reconciled by index, and
/// removal would shift indices under the in-flight item.
pub async fn remove_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    let removed = {
        let mut jobs = state.jobs.write().await;
        if jobs.processing {
            return Err(StatusCode::CONFLICT);
        }
        jobs.remove_item(id)
    };
    if !removed {
        return Err(StatusCode::NOT_FOUND);
    }

    if let Err(e) = state.store.delete(id).await {
        tracing::warn!(%id, error = %e, "failed to delete image payload");
    }
    state.persist_jobs().await;
    tracing::info!(%id, "image removed");

    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/v1/images — clear the queue and reset the state record.
/// Rejected while a run is active, same as single removal.
pub async fn clear_images(State(state): State<AppState>) -> StatusCode {
    let ids: Vec<Uuid> = {
        let mut jobs = state.jobs.write().await;
        if jobs.processing {
            return StatusCode::CONFLICT;
        }
        let ids = jobs.items.iter().map(|item| item.id).collect();
        jobs.clear();
        ids
    };

    for id in ids {
        if let Err(e) = state.store.delete(id).await {
            tracing::warn!(%id, error = %e, "failed to delete image payload");
        }
    }

    if let Err(e) = state.state_store.clear().await {
        tracing::warn!(error = %e, "failed to clear persisted state");
    }
    state.persist_jobs().await;
    tracing::info!("queue and store cleared");

    StatusCode::NO_CONTENT
}

/// GET /api/v1/state — metadata-only snapshot of the job state.
pub async fn get_state(State(state): State<AppState>) -> Json<StateResponse> {
    let jobs = state.jobs.read().await;
    Json(StateResponse {
        items: jobs.items.clone(),
        cursor: jobs.cursor,
        processing: jobs.processing,
        paused: jobs.paused,
        stats: jobs.stats,
        started_at: jobs.started_at,
        last_update: jobs.last_update,
        stuck: jobs.stuck,
        stuck_since: jobs.stuck_since,
        pause_until: jobs.pause_until,
    })
}

/// Accepts raw base64 or a full data URL.
fn decode_payload(data: &str) -> Option<Vec<u8>> {
    let encoded = match data.find("base64,") {
        Some(idx) => &data[idx + "base64,".len()..],
        None => data,
    };
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()
}
