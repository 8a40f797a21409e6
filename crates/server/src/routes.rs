use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use recast_core::error::ApiError;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::AppError;
use crate::state::AppState;
use crate::{listing, paths, streaming};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/convert.mp4", get(streaming::convert_mp4))
        .route("/convert.webm", get(streaming::convert_webm))
        .fallback(browse)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    tasks: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        tasks: state.registry.len().await,
    })
}

// ---------------------------------------------------------------------------
// Browsing
// ---------------------------------------------------------------------------

/// Directory paths (trailing `/`) get an index page; anything else is sent
/// to the mp4 converter.
async fn browse(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
) -> Result<Response, AppError> {
    if method != Method::GET && method != Method::HEAD {
        return Ok(StatusCode::METHOD_NOT_ALLOWED.into_response());
    }

    let decoded = urlencoding::decode(uri.path())
        .map_err(|_| ApiError::NotFound("path is not valid UTF-8".into()))?;

    if !decoded.ends_with('/') {
        let target = format!("/convert.mp4?path={}", urlencoding::encode(&decoded));
        debug!(path = %decoded, %target, "redirecting to converter");
        return Ok(Redirect::to(&target).into_response());
    }

    let dir = paths::resolve_dir(&state.root, &decoded)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("{decoded}: no such directory")))?;

    if method == Method::HEAD {
        return Ok(Html(String::new()).into_response());
    }

    let entries = listing::read_entries(&dir)
        .await
        .map_err(|e| ApiError::Internal(format!("read directory: {e}")))?;
    Ok(Html(listing::render(&decoded, &entries)).into_response())
}
