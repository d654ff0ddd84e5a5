use crate::events::EventStream;
use crate::services::cancel::CancelFlag;
use crate::services::model_manager::ModelManagerState;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub mod generate;
pub mod models;
pub mod settings;

/// Shared handler state. The cancel flag sits next to the manager, not
/// inside it, so raising it never waits on the manager lock.
#[derive(Clone)]
pub struct AppState {
    pub manager: ModelManagerState,
    pub cancel: CancelFlag,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    result: &'static str,
}

impl OkResponse {
    pub fn ok() -> Self {
        Self { result: "ok" }
    }
}

/// Newline-delimited JSON response over an event stream.
pub fn ndjson(stream: EventStream) -> Response {
    ([(header::CONTENT_TYPE, "application/x-ndjson")], stream.into_body()).into_response()
}
