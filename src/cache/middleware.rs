//! Response cache middleware.
//!
//! Serves cached bodies for repeated GET requests and stores successful
//! responses. Fallback responses (anything carrying an [`ErrorReport`]) and
//! non-200 responses are never stored.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, instrument};

use crate::application::error::ErrorReport;

use super::{
    keys::ResponseKey,
    store::{CachedResponse, ResponseCache},
};

pub const X_CACHE: &str = "x-cache";

/// Headers kept with a cached body.
const STORED_HEADERS: [HeaderName; 2] = [header::CONTENT_TYPE, header::CACHE_CONTROL];

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub responses: Arc<ResponseCache>,
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !cache.responses.is_enabled() || request.method() != Method::GET {
        return next.run(request).await;
    }

    let key = ResponseKey::new(request.uri().path(), request.uri().query());

    if let Some(cached) = cache.responses.get(&key) {
        debug!(cache = "response", outcome = "hit", key = key.as_str(), "serving cached response");
        return build_response(cached, "HIT");
    }

    debug!(cache = "response", outcome = "miss", "cache miss, executing handler");
    let mut response = next.run(request).await;

    let cacheable = response.status() == StatusCode::OK
        && response.extensions().get::<ErrorReport>().is_none();

    if !cacheable {
        response
            .headers_mut()
            .insert(X_CACHE, HeaderValue::from_static("MISS"));
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let cached = CachedResponse {
        status: parts.status.as_u16(),
        headers: STORED_HEADERS
            .iter()
            .filter_map(|name| {
                parts
                    .headers
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect(),
        body: bytes.clone(),
    };

    let stored = cache.responses.set(key, cached);
    debug!(cache = "response", stored, bytes = bytes.len(), "caching response");

    parts
        .headers
        .insert(X_CACHE, HeaderValue::from_static("MISS"));
    Response::from_parts(parts, Body::from(bytes))
}

/// Build a response from cached data.
fn build_response(cached: CachedResponse, marker: &'static str) -> Response {
    let mut builder = Response::builder().status(cached.status);

    for (name, value) in cached.headers {
        if let Ok(header_value) = HeaderValue::from_str(&value) {
            builder = builder.header(name, header_value);
        }
    }

    builder
        .header(X_CACHE, marker)
        .body(Body::from(cached.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
