//! `GET /render` and the fallback responses it produces on failure.

use axum::{
    Json,
    extract::{Query, State},
    http::{
        HeaderName, HeaderValue, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::{
    application::{
        error::{ErrorReport, formula_error_status},
        render::{RenderedArtifact, fallback::truncate_message},
    },
    config::{ErrorMode, ErrorSettings},
    domain::{
        error::FormulaError,
        options::{FormulaRequest, OutputFormat},
    },
};

use super::HttpState;

const SOURCE: &str = "infra::http::public::render";

pub const X_FORMULA_ERROR: HeaderName = HeaderName::from_static("x-formula-error");

/// How failed renders are reported. Consulted once per failed request.
#[derive(Debug, Clone, Copy)]
pub struct ErrorPolicy {
    pub mode: ErrorMode,
    pub max_message_chars: usize,
}

impl From<&ErrorSettings> for ErrorPolicy {
    fn from(settings: &ErrorSettings) -> Self {
        Self {
            mode: settings.mode,
            max_message_chars: settings.max_message_chars,
        }
    }
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            mode: ErrorMode::Inline,
            max_message_chars: 200,
        }
    }
}

pub(super) async fn render(
    State(state): State<HttpState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let format = OutputFormat::detect(&params);

    let result = match FormulaRequest::from_query(&params, &state.limits) {
        Ok(request) => state.service.render(&request).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(artifact) => success_response(artifact, state.success_max_age),
        Err(err) => fallback_response(&state, format, err).await,
    }
}

fn success_response(artifact: RenderedArtifact, max_age: u64) -> Response {
    let cache_control = format!("public, max-age={max_age}");
    let mut response = artifact_response(artifact);
    if let Ok(value) = HeaderValue::from_str(&cache_control) {
        response.headers_mut().insert(CACHE_CONTROL, value);
    }
    response
}

fn artifact_response(artifact: RenderedArtifact) -> Response {
    let content_type = artifact.content_type();
    (
        StatusCode::OK,
        [(CONTENT_TYPE, HeaderValue::from_static(content_type))],
        artifact.body,
    )
        .into_response()
}

async fn fallback_response(state: &HttpState, format: OutputFormat, error: FormulaError) -> Response {
    let status = formula_error_status(&error);
    let policy = state.errors;

    let mut response = match policy.mode {
        ErrorMode::Inline => {
            let artifact = state
                .service
                .fallback(format, &error, policy.max_message_chars)
                .await;
            artifact_response(artifact)
        }
        ErrorMode::Status => {
            let message = truncate_message(&error.to_string(), policy.max_message_chars);
            (
                status,
                Json(json!({
                    "error": {
                        "kind": error.kind(),
                        "message": message,
                    }
                })),
            )
                .into_response()
        }
    };

    let headers = response.headers_mut();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    let summary = header_safe(&error.to_string(), policy.max_message_chars);
    if let Ok(value) = HeaderValue::from_str(&summary) {
        headers.insert(X_FORMULA_ERROR, value);
    }

    ErrorReport::from_error(SOURCE, status, &error).attach(&mut response);
    response
}

/// Header-safe, truncated rendering of an error message.
fn header_safe(message: &str, max_chars: usize) -> String {
    let visible: String = message
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '?' })
        .collect();
    truncate_message(&visible, max_chars)
}
