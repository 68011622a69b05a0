//! Middleware for panic recovery and request logging

use axum::body::{to_bytes, Body, HttpBody as _};
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{error, info};
use uuid::Uuid;

use super::response::{code, error_json, ApiError};

/// Largest body of known size buffered for logging; larger or streamed
/// bodies are passed through without being read
pub const MAX_BUFFERED_BODY: usize = 1024 * 1024;

/// Bytes of a buffered body written to the log
pub const LOGGED_BODY_PREFIX: usize = 4096;

/// Request identifier assigned by [`log_requests`], available as an extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceId(pub String);

impl TraceId {
    fn generate() -> Self {
        Self(format!("A{}", Uuid::new_v4()))
    }
}

/// Turn a handler panic into an error envelope.
///
/// Panics raised with an [`ApiError`] payload (`std::panic::panic_any`) keep
/// their code and message; anything else becomes a system error.
pub fn recover_panic(payload: Box<dyn Any + Send + 'static>) -> Response {
    if let Some(err) = payload.downcast_ref::<ApiError>() {
        error!("Handler aborted: {}", err);
        return err.clone().into_response();
    }

    let detail = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic payload");
    error!("Handler panicked: {}", detail);
    error_json(code::SYSTEM_ERR, "")
}

/// Layer installing [`recover_panic`]
pub fn exception_layer() -> CatchPanicLayer<fn(Box<dyn Any + Send + 'static>) -> Response> {
    CatchPanicLayer::custom(recover_panic as fn(Box<dyn Any + Send + 'static>) -> Response)
}

/// Routes whose bodies are left out of the request log
#[derive(Debug, Clone, Default)]
pub struct RequestLogConfig {
    skip_request_body: Arc<HashSet<String>>,
    skip_response_body: Arc<HashSet<String>>,
}

impl RequestLogConfig {
    pub fn new<I, J>(skip_request_body: I, skip_response_body: J) -> Self
    where
        I: IntoIterator<Item = String>,
        J: IntoIterator<Item = String>,
    {
        Self {
            skip_request_body: Arc::new(skip_request_body.into_iter().collect()),
            skip_response_body: Arc::new(skip_response_body.into_iter().collect()),
        }
    }
}

/// Headers as a JSON object of name to list of values
fn headers_json(headers: &HeaderMap) -> String {
    let map: HashMap<&str, Vec<String>> = headers
        .keys()
        .map(|name| {
            let values = headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            (name.as_str(), values)
        })
        .collect();
    serde_json::to_string(&map).unwrap_or_default()
}

/// Log text for a buffered body, cut to [`LOGGED_BODY_PREFIX`] bytes
fn body_preview(bytes: &[u8]) -> String {
    if bytes.len() <= LOGGED_BODY_PREFIX {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    format!(
        "{}... ({} bytes)",
        String::from_utf8_lossy(&bytes[..LOGGED_BODY_PREFIX]),
        bytes.len()
    )
}

/// Read `body` for logging when that is safe, returning the log text and the
/// body to forward.
///
/// Skipped bodies and bodies that are streamed or larger than
/// [`MAX_BUFFERED_BODY`] are forwarded untouched.
async fn capture_body(body: Body, skipped: bool, kind: &str) -> Result<(String, Body), axum::Error> {
    if skipped {
        return Ok((format!("{} body not logged for this route", kind), body));
    }

    match body.size_hint().upper() {
        Some(len) if len <= MAX_BUFFERED_BODY as u64 => {
            let bytes = to_bytes(body, MAX_BUFFERED_BODY).await?;
            Ok((body_preview(&bytes), Body::from(bytes)))
        }
        Some(len) => Ok((format!("<{} bytes not logged>", len), body)),
        None => Ok(("<streamed body not logged>".to_string(), body)),
    }
}

/// Request logging middleware
///
/// Logs `[Api] | id | METHOD | uri | Header:.. | Body:.. | END` before the
/// handler runs and `[Api] | id | status | RespBody: .. | elapsed | END`
/// afterwards. Bodies on the skip-lists are never read.
pub async fn log_requests(State(config): State<RequestLogConfig>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    let trace_id = TraceId::generate();

    let (mut parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    let (logged_request, body) =
        match capture_body(body, config.skip_request_body.contains(&path), "request").await {
            Ok(captured) => captured,
            Err(e) => {
                info!("[Api] | {} | {} | {} | unreadable body: {} | END", trace_id.0, parts.method, parts.uri, e);
                return error_json(code::ARG_ERR, "request body could not be read");
            }
        };
    info!(
        "[Api] | {} | {} | {} | Header:{} | Body:{} | END",
        trace_id.0,
        parts.method,
        parts.uri,
        headers_json(&parts.headers),
        logged_request
    );

    parts.extensions.insert(trace_id.clone());
    let response = next.run(Request::from_parts(parts, body)).await;

    let (parts, body) = response.into_parts();
    let (logged_response, body) =
        match capture_body(body, config.skip_response_body.contains(&path), "response").await {
            Ok(captured) => captured,
            Err(e) => {
                error!("[Api] | {} | response body could not be read: {} | END", trace_id.0, e);
                return error_json(code::SYSTEM_ERR, "");
            }
        };
    info!(
        "[Api] | {} | status: {} | RespBody: {} | elapsed: {:.5}s | END",
        trace_id.0,
        parts.status.as_u16(),
        logged_response,
        start.elapsed().as_secs_f64()
    );

    Response::from_parts(parts, body)
}
