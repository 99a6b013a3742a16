mod cache;
mod middleware;
mod public;

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::{
    application::{
        error::HttpError,
        render::{EngineState, FormulaService},
    },
    cache::{CacheState, response_cache_layer},
    domain::options::InputLimits,
};

pub use cache::{ArtifactSummary, CacheStatsBody};
pub use middleware::RequestContext;
pub use public::{ErrorPolicy, X_FORMULA_ERROR};

#[derive(Clone)]
pub struct HttpState {
    pub service: Arc<FormulaService>,
    pub cache: CacheState,
    pub limits: InputLimits,
    pub errors: ErrorPolicy,
    /// `max-age` advertised on successful renders, in seconds.
    pub success_max_age: u64,
}

pub fn build_router(state: HttpState) -> Router {
    // Only rendered artifacts go through the response cache.
    let cached_routes = Router::new()
        .route("/render", get(public::render))
        .layer(axum_middleware::from_fn_with_state(
            state.cache.clone(),
            response_cache_layer,
        ));

    let service_routes = Router::new()
        .route("/cache/stats", get(cache::stats))
        .route("/cache/clear", get(cache::clear).post(cache::clear))
        .route("/health", get(health));

    cached_routes
        .merge(service_routes)
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}

async fn health(State(state): State<HttpState>) -> Response {
    match state.service.lifecycle().state() {
        EngineState::Failed { message, .. } => HttpError::new(
            "infra::http::health",
            StatusCode::SERVICE_UNAVAILABLE,
            "Rendering engine unavailable",
            message,
        )
        .into_response(),
        _ => StatusCode::NO_CONTENT.into_response(),
    }
}
