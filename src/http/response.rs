//! Proxy-generated responses and response decoration.
//!
//! # Responsibilities
//! - Render error pages from the embedded HTML template
//! - Attach debug headers when the client asked for them
//! - Mark responses whose connection must be dropped unanswered

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Response, StatusCode};
use thiserror::Error;

use crate::http::context::RequestContext;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const ERROR_TEMPLATE: &str = include_str!("../../static/error.html");

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn set(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Render an error page.
///
/// With `debug`, the message is also exposed in `x-debug-error`.
pub fn error_page(status: StatusCode, message: &str, debug: bool) -> Response<Body> {
    let html = ERROR_TEMPLATE
        .replace("{{code}}", status.as_str())
        .replace("{{reason}}", status.canonical_reason().unwrap_or(""))
        .replace("{{message}}", &escape_html(message));

    let mut response = Response::new(Body::from(html));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("-1"));

    if debug {
        set(headers, "x-debug-error", message);
        set(headers, "x-debug-version", VERSION);
    }
    response
}

/// The answer to the reserved ping host.
pub fn ping() -> Response<Body> {
    let mut response = Response::new(Body::from("ok"));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Response marker: the server hangs up instead of writing the response.
#[derive(Debug, Clone, Copy, Error)]
#[error("connection dropped without a response")]
pub struct DropConnection;

/// Used when an upgrade cannot be proxied; the client sees the socket close.
pub fn drop_connection() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response.extensions_mut().insert(DropConnection);
    response
}

/// Attach `x-debug-*` headers describing how the request was routed.
pub fn insert_debug_headers(headers: &mut HeaderMap, ctx: &RequestContext) {
    set(headers, "x-debug-version", VERSION);
    if let Some(backend) = &ctx.backend {
        set(headers, "x-debug-backend-url", &backend.url());
        set(headers, "x-debug-backend-id", backend.instance_id());
        set(headers, "x-debug-vhost", backend.virtual_host());
    }
    if let Some(frontend) = &ctx.frontend {
        set(headers, "x-debug-frontend-key", frontend);
    }
    set(
        headers,
        "x-debug-time-total",
        &ctx.time_to_headers().as_millis().to_string(),
    );
    set(
        headers,
        "x-debug-time-backend",
        &ctx.backend_time_to_headers().as_millis().to_string(),
    );
}
