use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

pub static X_TRACE_ID: &str = "x-trace-id";
pub static X_PROCESS_TIME: &str = "x-process-time";

/// Wraps each request in an `http_request` span.
///
/// Reuses the caller's `x-trace-id` when it is a UUID and generates one
/// otherwise. The id is echoed on the response together with
/// `x-process-time` (seconds, as a float).
pub async fn trace_middleware(mut req: Request<Body>, next: Next) -> Response {
    let start_time = Instant::now();

    let trace_id = req
        .headers()
        .get(X_TRACE_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);
    let trace_header = HeaderValue::from_str(&trace_id.to_string()).ok();

    let span = info_span!(
        "http_request",
        trace_id = %trace_id,
        method = %req.method(),
        path = %req.uri().path(),
    );

    async move {
        info!("→ request started");
        if let Some(value) = trace_header.clone() {
            req.headers_mut().insert(X_TRACE_ID, value);
        }

        let mut response = next.run(req).await;

        let latency = start_time.elapsed();
        let headers = response.headers_mut();
        if let Some(value) = trace_header {
            headers.insert(X_TRACE_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("{:.6}", latency.as_secs_f64())) {
            headers.insert(X_PROCESS_TIME, value);
        }

        info!(
            status = response.status().as_u16(),
            latency_ms = latency.as_millis(),
            "← response finished"
        );
        response
    }
    .instrument(span)
    .await
}
