//! Read-only metrics/history/queue endpoints and the control hooks
//! (queue clear, config reload) consumed by external management surfaces.
//!
//! Gated by the master credential when inbound auth is configured.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, StatusCode, header};
use serde_json::json;
use tracing::{info, warn};

use crate::config;
use crate::domain::error::ProxyError;

use super::super::AppState;
use super::super::error::error_response;

fn require_master(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let engine = state.handle.engine();
    if !engine.server.auth_enabled() {
        return Ok(());
    }
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| engine.server.is_master_credential(token.trim()));
    if authorized {
        Ok(())
    } else {
        Err(error_response(&ProxyError::Unauthorized))
    }
}

pub async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_master(&state, &headers) {
        return denied;
    }
    Json(state.handle.registry().summary()).into_response()
}

pub async fn history(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_master(&state, &headers) {
        return denied;
    }
    Json(state.handle.history().snapshot()).into_response()
}

pub async fn queues(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_master(&state, &headers) {
        return denied;
    }
    let engine = state.handle.engine();
    let depths: serde_json::Map<String, serde_json::Value> = engine
        .upstreams()
        .map(|ctx| {
            (
                ctx.upstream.id.clone(),
                json!({
                    "depth": ctx.queue.depth(),
                    "max_size": ctx.upstream.queue.max_size,
                    "max_workers": ctx.upstream.queue.max_workers,
                    "expiry_seconds": ctx.upstream.queue.expiry.as_secs(),
                }),
            )
        })
        .collect();
    Json(serde_json::Value::Object(depths)).into_response()
}

pub async fn clear_queue(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = require_master(&state, &headers) {
        return denied;
    }
    let engine = state.handle.engine();
    let Some(ctx) = engine.upstream(&id) else {
        return error_response(&ProxyError::not_found(id));
    };
    let cleared = ctx.queue.clear();
    ctx.metrics
        .queue
        .canceled
        .fetch_add(cleared as u64, std::sync::atomic::Ordering::Relaxed);
    info!(upstream = %id, cleared, "queue cleared");
    Json(json!({ "cleared": cleared })).into_response()
}

pub async fn reload_config(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_master(&state, &headers) {
        return denied;
    }
    let Some(path) = &state.config_path else {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "no configuration file to reload" })),
        )
            .into_response();
    };

    match config::load_snapshot(path) {
        Ok(snapshot) => match state.handle.install(snapshot) {
            Ok(()) => Json(json!({ "reloaded": true })).into_response(),
            Err(err) => {
                warn!(error = %err, "reload rejected, previous generation keeps serving");
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(json!({ "error": err.to_string() })),
                )
                    .into_response()
            }
        },
        Err(err) => {
            warn!(error = %err, "reload rejected, previous generation keeps serving");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}
