use crate::app_error::ApiError;
use crate::config::models::{ModelConfig, ModelConfigUpdate};
use crate::controllers::{AppState, OkResponse, ndjson};
use crate::events::event_channel;
use axum::Json;
use axum::extract::{Path, State};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ModelListResponse {
    result: &'static str,
    models: BTreeMap<Uuid, String>,
    current_model: Option<Uuid>,
}

pub async fn get_models(State(state): State<AppState>) -> Json<ModelListResponse> {
    let manager = state.manager.lock().await;
    Json(ModelListResponse {
        result: "ok",
        models: manager.list_models(),
        current_model: manager.current_model_id(),
    })
}

/// Create-or-update body: a missing or `"new"` id creates a model, any
/// other id edits that entry.
#[derive(Debug, Deserialize)]
pub struct ModelUpsertRequest {
    id: Option<String>,
    #[serde(flatten)]
    update: ModelConfigUpdate,
}

#[derive(Debug, Serialize)]
pub struct ModelUpsertResponse {
    result: &'static str,
    id: Uuid,
}

pub async fn post_models(
    State(state): State<AppState>,
    Json(payload): Json<ModelUpsertRequest>,
) -> Result<Json<ModelUpsertResponse>, ApiError> {
    let mut manager = state.manager.lock().await;
    let id = match payload.id.as_deref() {
        None | Some("new") => manager.create_model(payload.update)?,
        Some(raw) => {
            let id = raw
                .parse::<Uuid>()
                .map_err(|_| ApiError::BadRequest(format!("invalid model id: {raw}")))?;
            manager.update_model(id, payload.update)?;
            id
        }
    };
    Ok(Json(ModelUpsertResponse { result: "ok", id }))
}

#[derive(Debug, Serialize)]
pub struct ModelDetailResponse {
    result: &'static str,
    model: ModelConfig,
}

pub async fn get_model(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ModelDetailResponse>, ApiError> {
    let manager = state.manager.lock().await;
    let model = manager
        .model_info(id)
        .ok_or_else(|| ApiError::NotFound(format!("model {id} not found")))?
        .clone();
    Ok(Json(ModelDetailResponse { result: "ok", model }))
}

pub async fn delete_model(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    let mut manager = state.manager.lock().await;
    manager.remove_model(id)?;
    Ok(Json(OkResponse::ok()))
}

/// Kick off a load and stream its progress. The worker holds the manager
/// lock for the whole attempt, which is what serializes loads against
/// each other and against generation.
pub async fn post_load_model(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let (tx, stream) = event_channel();
    let manager = state.manager.clone();
    tokio::spawn(async move {
        let mut manager = manager.lock().await;
        manager.load_model(id, &tx).await;
    });
    ndjson(stream)
}

pub async fn post_unload_model(State(state): State<AppState>) -> Json<OkResponse> {
    let mut manager = state.manager.lock().await;
    manager.unload_model().await;
    Json(OkResponse::ok())
}
