use crate::app_error::ApiError;
use crate::config::settings::AppSettings;
use crate::controllers::{AppState, OkResponse};
use axum::Json;
use axum::extract::State;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    result: &'static str,
    settings: AppSettings,
}

pub async fn get_settings(State(state): State<AppState>) -> Json<SettingsResponse> {
    let manager = state.manager.lock().await;
    Json(SettingsResponse { result: "ok", settings: manager.settings().clone() })
}

/// Replace and persist the app settings. The simulated device list takes
/// effect on the next start; sampling and chunk defaults apply at once.
pub async fn post_settings(
    State(state): State<AppState>,
    Json(settings): Json<AppSettings>,
) -> Result<Json<OkResponse>, ApiError> {
    let mut manager = state.manager.lock().await;
    manager.update_settings(settings)?;
    Ok(Json(OkResponse::ok()))
}
