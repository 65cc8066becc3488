//! The proxy handler: route, filter, authenticate, capture, enqueue,
//! await, stream back.

use std::net::SocketAddr;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::{HeaderMap, Method, StatusCode, header};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::domain::error::ProxyError;
use crate::domain::model::CorsSettings;
use crate::engine::Engine;
use crate::infra::encoding::decode_body;
use crate::infra::headers::client_ip;
use crate::infra::queue::{QueuedEntry, UpstreamContext};
use crate::infra::request::{BodyStream, BoxError, CapturedBody, CapturedRequest};

use super::super::AppState;
use super::super::error::error_response;

pub async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let engine = state.handle.engine();
    match handle(&state, &engine, peer, req).await {
        Ok(response) => response,
        Err(err) => {
            let mut response = error_response(&err);
            apply_cors(&mut response, engine.server.cors.as_ref());
            response
        }
    }
}

async fn handle(
    state: &AppState,
    engine: &Engine,
    peer: SocketAddr,
    req: Request,
) -> Result<Response, ProxyError> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let method = req.method().clone();

    let resolved = engine.resolve(&path);

    // CORS preflight is answered directly when configured; without CORS it
    // proxies like any other method.
    if method == Method::OPTIONS
        && let Some(cors) = &engine.server.cors
    {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(&mut response, Some(cors));
        return Ok(response);
    }

    let (ctx, suffix) = resolved.ok_or_else(|| ProxyError::not_found(trim_path(&path)))?;

    if !ctx.upstream.method_allowed(&method) {
        return Err(ProxyError::MethodNotAllowed {
            upstream: ctx.upstream.id.clone(),
            method: method.to_string(),
        });
    }

    if let Some(filter) = &ctx.upstream.path_filter
        && !filter.allows(&suffix)
    {
        return Err(ProxyError::PathForbidden {
            upstream: ctx.upstream.id.clone(),
        });
    }

    // Proxy-user authentication gates everything past this point.
    let user = if engine.server.auth_enabled() {
        let token = bearer_token(req.headers())
            .filter(|t| engine.server.is_known_credential(t))
            .ok_or(ProxyError::Unauthorized)?;
        Some(token)
    } else {
        None
    };

    let client_ip = client_ip(req.headers(), &peer.ip().to_string());
    let headers = req.headers().clone();
    let body = capture_body(engine.server.max_body_buffer, &ctx, &headers, req).await?;

    let (request, headers) = match body {
        Captured::Passthrough(body) => (body, headers),
        Captured::Rewritten(bytes) => {
            // Re-serialized identity-encoded body; the stale length and
            // encoding headers must not survive.
            let mut headers = headers;
            headers.remove(header::CONTENT_ENCODING);
            headers.remove(header::CONTENT_LENGTH);
            (CapturedBody::Buffered(bytes), headers)
        }
    };

    let captured = CapturedRequest {
        method,
        suffix,
        query,
        headers,
        body: request,
        client_ip,
        user,
    };

    submit_and_await(state, engine, &ctx, captured).await
}

enum Captured {
    Passthrough(CapturedBody),
    Rewritten(Bytes),
}

/// Capture the request body. Bodies the rewriter must touch are buffered
/// (decoding any content-encoding first); small bodies are buffered for
/// retry replay; everything else streams through with backpressure.
async fn capture_body(
    limit: usize,
    ctx: &UpstreamContext,
    headers: &HeaderMap,
    req: Request,
) -> Result<Captured, ProxyError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let rewriter_engages =
        ctx.upstream.rewrite.is_some() && content_type.starts_with("application/json");
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    let body = req.into_body();

    if rewriter_engages {
        let bytes = buffer_body(body, limit).await?;
        if bytes.is_empty() {
            return Ok(Captured::Passthrough(CapturedBody::Empty));
        }
        let encoding = headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        return Ok(rewrite_body(ctx, &bytes, encoding));
    }

    match content_length {
        Some(0) => Ok(Captured::Passthrough(CapturedBody::Empty)),
        Some(len) if len <= limit => {
            let bytes = buffer_body(body, limit).await?;
            Ok(Captured::Passthrough(CapturedBody::Buffered(bytes)))
        }
        // Unknown or large length: stream, single attempt.
        _ => {
            let stream: BodyStream =
                Box::pin(body.into_data_stream().map_err(|e| Box::new(e) as BoxError));
            Ok(Captured::Passthrough(CapturedBody::Stream(Some(stream))))
        }
    }
}

async fn buffer_body(body: Body, limit: usize) -> Result<Bytes, ProxyError> {
    axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| ProxyError::PayloadTooLarge {
            detail: format!("request body exceeds the {limit}-byte buffer limit"),
        })
}

/// Run the rewrite plan. A body no rule touches is forwarded byte-identical
/// (original bytes, original encoding); undecodable or non-JSON payloads
/// pass through untouched as well.
fn rewrite_body(ctx: &UpstreamContext, bytes: &Bytes, encoding: &str) -> Captured {
    let plan = ctx
        .upstream
        .rewrite
        .as_ref()
        .expect("caller checked rewrite presence");

    let decoded = match decode_body(bytes, encoding) {
        Ok(decoded) => decoded,
        Err(reason) => {
            warn!(upstream = %ctx.upstream.id, reason, "skipping body rewrite");
            return Captured::Passthrough(CapturedBody::Buffered(bytes.clone()));
        }
    };

    let mut value: serde_json::Value = match serde_json::from_slice(&decoded) {
        Ok(value) => value,
        Err(err) => {
            debug!(upstream = %ctx.upstream.id, %err, "declared JSON body did not parse, forwarding unchanged");
            return Captured::Passthrough(CapturedBody::Buffered(bytes.clone()));
        }
    };

    if plan.apply(&mut value) {
        let serialized =
            serde_json::to_vec(&value).expect("rewritten JSON value serializes");
        Captured::Rewritten(Bytes::from(serialized))
    } else {
        Captured::Passthrough(CapturedBody::Buffered(bytes.clone()))
    }
}

/// Enqueue on the upstream's admission queue and await the worker's reply.
async fn submit_and_await(
    state: &AppState,
    engine: &Engine,
    ctx: &UpstreamContext,
    captured: CapturedRequest,
) -> Result<Response, ProxyError> {
    let now = Instant::now();
    let (reply, rx) = oneshot::channel();
    let entry = QueuedEntry {
        request: captured,
        enqueued_at: now,
        deadline: now + ctx.upstream.queue.expiry,
        reply,
    };

    if ctx.queue.submit(entry).is_err() {
        state
            .handle
            .registry()
            .record_rate_limit_hit(&ctx.upstream.id);
        return Err(ProxyError::QueueFull {
            upstream: ctx.upstream.id.clone(),
        });
    }
    ctx.metrics
        .queue
        .enqueued
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    match rx.await {
        Ok(Ok(proxied)) => {
            let mut response = Response::builder()
                .status(proxied.status)
                .body(Body::from_stream(proxied.body))
                .map_err(|e| ProxyError::network(&ctx.upstream.id, e.to_string()))?;
            *response.headers_mut() = proxied.headers;
            apply_cors(&mut response, engine.server.cors.as_ref());
            Ok(response)
        }
        Ok(Err(err)) => Err(err),
        // The worker pool dropped the reply channel (generation drained).
        Err(_) => Err(ProxyError::network(
            &ctx.upstream.id,
            "proxy is shutting down",
        )),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
}

fn trim_path(path: &str) -> &str {
    path.trim_start_matches("/api/").trim_matches('/')
}

fn apply_cors(response: &mut Response, cors: Option<&CorsSettings>) {
    let Some(cors) = cors else { return };
    let headers = response.headers_mut();
    let pairs = [
        ("access-control-allow-origin", cors.allow_origin.as_str()),
        ("access-control-allow-methods", cors.allow_methods.as_str()),
        ("access-control-allow-headers", cors.allow_headers.as_str()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = http::HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
}
