//! Cache introspection endpoints.

use axum::{
    Json,
    extract::State,
    http::{StatusCode, header::CACHE_CONTROL},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::info;

use crate::{application::render::EngineStatus, cache::StoreStats};

use super::HttpState;

#[derive(Debug, Serialize)]
pub struct CacheStatsBody {
    pub response: StoreStats,
    pub response_enabled: bool,
    pub artifacts: ArtifactSummary,
    pub engine: EngineStatus,
    pub speech_engines: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct ArtifactSummary {
    pub entries: usize,
    pub fragments: StoreStats,
}

pub(super) async fn stats(State(state): State<HttpState>) -> Response {
    let status = state.service.status();
    let body = CacheStatsBody {
        response: state.cache.responses.stats(),
        response_enabled: state.cache.responses.is_enabled(),
        artifacts: ArtifactSummary {
            entries: state.service.artifacts().len(),
            fragments: status.artifacts,
        },
        engine: status.engine,
        speech_engines: status.speech_engines,
    };
    ([(CACHE_CONTROL, "no-store")], Json(body)).into_response()
}

pub(super) async fn clear(State(state): State<HttpState>) -> Response {
    let dropped = state.cache.responses.len();
    state.cache.responses.clear();
    info!(
        target = "mathgate::http::cache",
        op = "clear",
        dropped,
        "response cache cleared"
    );
    (
        StatusCode::OK,
        [(CACHE_CONTROL, "no-store")],
        Json(serde_json::json!({ "cleared": dropped })),
    )
        .into_response()
}
