// SPDX-License-Identifier: MIT OR Apache-2.0
//! Middleware stack for the backplane HTTP API.

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RequestId middleware
// ---------------------------------------------------------------------------

/// A unique request identifier, available as an Axum extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

/// Axum middleware that generates a [`RequestId`] for each request and sets
/// the `X-Request-Id` response header.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    req.extensions_mut().insert(id);
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

// ---------------------------------------------------------------------------
// RequestLogger
// ---------------------------------------------------------------------------

/// Axum middleware that logs method, path, status code, and duration for
/// each request using [`tracing`] structured fields.
pub async fn request_logger_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let resp = next.run(req).await;

    let duration = start.elapsed();
    let status = resp.status().as_u16();

    info!(
        http.method = %method,
        http.path = %path,
        http.status = status,
        http.duration_ms = duration.as_millis() as u64,
        "request completed"
    );

    resp
}
