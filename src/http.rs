//! Minimal HTTP/1.1 framing for the server binary.

use crate::error::NlqError;
use serde_json::json;
use std::collections::HashMap;

/// Upper bound on a request head plus body.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Lower-cased names.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

/// Offset just past the blank line ending the head.
pub fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

pub fn extract_content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Total request size announced by a head ending at `head_end`. `None` when
/// the sum does not fit in `usize`.
pub fn announced_length(head: &str, head_end: usize) -> Option<usize> {
    head_end.checked_add(extract_content_length(head))
}

/// Parse a complete request. `None` when the request line is unusable.
pub fn parse_request(raw: &[u8]) -> Option<HttpRequest> {
    let end = header_end(raw).unwrap_or(raw.len());
    let head = String::from_utf8_lossy(&raw[..end]);
    let mut lines = head.lines();

    let mut parts = lines.next()?.split_whitespace();
    let method = parts.next()?.to_uppercase();
    let target = parts.next()?;

    let (raw_path, raw_query) = target.split_once('?').unwrap_or((target, ""));
    let mut path = raw_path.trim_end_matches('/').to_string();
    if path.is_empty() {
        path = "/".to_string();
    }

    let query = raw_query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let body = String::from_utf8_lossy(&raw[end..]).to_string();
    Some(HttpRequest {
        method,
        path,
        query,
        headers,
        body,
    })
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

fn cors_headers() -> &'static str {
    "Access-Control-Allow-Origin: *\r\n\
     Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
     Access-Control-Allow-Headers: Content-Type, X-Tenant-Id\r\n"
}

pub fn json_response(status: u16, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         {}\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        status_text(status),
        cors_headers(),
        body.len(),
        body
    )
}

/// Head of an event-stream response; events follow until the socket closes.
pub fn sse_headers() -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/event-stream\r\n\
         Cache-Control: no-cache\r\n\
         Connection: keep-alive\r\n\
         X-Accel-Buffering: no\r\n\
         {}\
         \r\n",
        cors_headers()
    )
}

/// HTTP status for an error surfaced by a non-streaming route.
pub fn error_status(err: &NlqError) -> u16 {
    match err {
        NlqError::InvalidRequest(_) | NlqError::SqlValidation(_) | NlqError::Json(_) => 400,
        NlqError::Generation(_) => 502,
        NlqError::Configuration(_) => 503,
        _ => 500,
    }
}

pub fn error_response(err: &NlqError) -> String {
    let body = json!({ "error": err.to_string(), "kind": err.kind() });
    json_response(error_status(err), &body.to_string())
}
