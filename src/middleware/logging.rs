//! Request logging middleware.
//!
//! Logs every HTTP request with method, path, status code, and latency.
//! Modeled on the teacher's `info_span!("http_request", ...)` shape:
//! fields recorded after `next.run()`, `warn!` for 5xx, `info!` otherwise.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn, Span};

/// Logs at INFO level for successful requests, WARN level for errors.
/// Includes: method, path, status code, latency in milliseconds.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // Skip logging for health checks to reduce noise.
    if path == "/health" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let span = tracing::info_span!(
        "http_request",
        method = %method,
        path = %path,
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );
    let _guard = span.enter();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();
    Span::current().record("status", status);
    Span::current().record("latency_ms", latency.as_millis() as u64);

    if status >= 500 {
        warn!(method = %method, path = %path, status, latency_ms = latency.as_millis(), "request failed (5xx)");
    } else {
        info!(method = %method, path = %path, status, latency_ms = latency.as_millis(), "request completed");
    }

    response
}
