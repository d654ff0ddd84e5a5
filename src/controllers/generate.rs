use crate::config::models::SamplingDefaults;
use crate::controllers::{AppState, OkResponse, ndjson};
use crate::events::event_channel;
use axum::Json;
use axum::extract::State;
use axum::response::Response;
use serde::{Deserialize, Serialize};

const DEFAULT_MAX_NEW_TOKENS: u32 = 512;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    text: String,
    max_new_tokens: Option<u32>,
    #[serde(flatten)]
    sampling: SamplingDefaults,
}

/// Stream completion chunks as NDJSON. The worker queues on the manager
/// lock, so a generation waits for any in-flight load or generation.
pub async fn post_generate(
    State(state): State<AppState>,
    Json(payload): Json<GenerateRequest>,
) -> Response {
    let (tx, stream) = event_channel();
    let manager = state.manager.clone();
    tokio::spawn(async move {
        let mut manager = manager.lock().await;
        let max_new_tokens = payload.max_new_tokens.unwrap_or(DEFAULT_MAX_NEW_TOKENS);
        manager.generate(&payload.text, max_new_tokens, &payload.sampling, &tx).await;
    });
    ndjson(stream)
}

/// Raise the cancel flag. Deliberately lock-free so it works while a
/// generation holds the manager.
pub async fn post_cancel_generate(State(state): State<AppState>) -> Json<OkResponse> {
    state.cancel.raise();
    Json(OkResponse::ok())
}

#[derive(Debug, Deserialize)]
pub struct CountTokensRequest {
    text: String,
}

#[derive(Debug, Serialize)]
pub struct CountTokensResponse {
    result: &'static str,
    token_count: usize,
}

pub async fn post_count_tokens(
    State(state): State<AppState>,
    Json(payload): Json<CountTokensRequest>,
) -> Json<CountTokensResponse> {
    let manager = state.manager.lock().await;
    Json(CountTokensResponse { result: "ok", token_count: manager.count_tokens(&payload.text) })
}
