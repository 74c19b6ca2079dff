//! Outbound HTTP response representation
//!
//! Built either by the embedder through the response-writer operations or
//! by the engine itself for the canned outcomes (404, 413, 500, 504), then
//! converted into a hyper response at flush time.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http_body_util::Full;
use smallvec::SmallVec;
use tracing::warn;

/// HTTP status code. Plain u16 so the boundary can request any status;
/// values hyper rejects are flushed as 500.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StatusCode(pub u16);

impl StatusCode {
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const GATEWAY_TIMEOUT: StatusCode = StatusCode(504);
}

/// One response, headers in insertion order with duplicates preserved.
#[derive(Debug)]
pub(crate) struct Response {
    pub status: StatusCode,
    pub headers: SmallVec<[(String, String); 8]>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: SmallVec::new(),
            body: Bytes::new(),
        }
    }

    /// Plain-text response with an explicit status.
    pub fn text(status: StatusCode, body: &str) -> Self {
        let mut response = Self::new(status);
        response.append_header("Content-Type", "text/plain");
        response.body = Bytes::copy_from_slice(body.as_bytes());
        response
    }

    pub fn not_found() -> Self {
        Self::text(StatusCode::NOT_FOUND, "Not Found")
    }

    pub fn bad_request(message: &str) -> Self {
        Self::text(StatusCode::BAD_REQUEST, message)
    }

    pub fn payload_too_large() -> Self {
        Self::text(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large")
    }

    pub fn internal_error(message: &str) -> Self {
        Self::text(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn gateway_timeout() -> Self {
        Self::text(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
    }

    /// Append a header; duplicates are preserved, never replaced.
    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Convert into a hyper response. Headers the http types reject are
    /// dropped with a warning rather than failing the whole response.
    pub fn into_hyper(self) -> hyper::Response<Full<Bytes>> {
        let status = http::StatusCode::from_u16(self.status.0)
            .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = hyper::Response::new(Full::new(self.body));
        *response.status_mut() = status;
        for (name, value) in self.headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(header_name), Ok(header_value)) => {
                    response.headers_mut().append(header_name, header_value);
                }
                _ => warn!(header = %name, "dropping malformed response header"),
            }
        }
        response
    }
}

/// Content type inferred from a file path's extension, with a binary
/// fallback for anything unknown.
pub(crate) fn mime_for_path(path: &str) -> &'static str {
    let extension = path
        .rsplit('.')
        .next()
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_response() {
        let response = Response::text(StatusCode(200), "hello");
        assert_eq!(response.status, StatusCode(200));
        assert_eq!(response.body.as_ref(), b"hello");
        assert_eq!(
            response.headers.as_slice(),
            &[("Content-Type".to_string(), "text/plain".to_string())]
        );
    }

    #[test]
    fn test_append_preserves_duplicates() {
        let mut response = Response::new(StatusCode(200));
        response.append_header("Set-Cookie", "a=1");
        response.append_header("Set-Cookie", "b=2");
        assert_eq!(response.headers.len(), 2);
    }

    #[test]
    fn test_into_hyper_keeps_duplicates() {
        let mut response = Response::new(StatusCode(200));
        response.append_header("Set-Cookie", "a=1");
        response.append_header("Set-Cookie", "b=2");
        let hyper_response = response.into_hyper();

        let cookies: Vec<_> = hyper_response
            .headers()
            .get_all("set-cookie")
            .iter()
            .collect();
        assert_eq!(cookies.len(), 2);
        assert_eq!(hyper_response.status(), http::StatusCode::OK);
    }

    #[test]
    fn test_into_hyper_drops_bad_header() {
        let mut response = Response::new(StatusCode(200));
        response.append_header("Bad Name", "x");
        response.append_header("Good-Name", "y");
        let hyper_response = response.into_hyper();

        assert!(hyper_response.headers().get("Good-Name").is_some());
        assert_eq!(hyper_response.headers().len(), 1);
    }

    #[test]
    fn test_unknown_status_becomes_500() {
        let response = Response::new(StatusCode(9999));
        assert_eq!(
            response.into_hyper().status(),
            http::StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_mime_for_path() {
        assert_eq!(mime_for_path("/srv/index.html"), "text/html");
        assert_eq!(mime_for_path("app.JS"), "application/javascript");
        assert_eq!(mime_for_path("data.json"), "application/json");
        assert_eq!(mime_for_path("img.jpeg"), "image/jpeg");
        assert_eq!(mime_for_path("font.woff2"), "font/woff2");
        assert_eq!(mime_for_path("archive.tar.gz"), "application/octet-stream");
        assert_eq!(mime_for_path("noext"), "application/octet-stream");
    }
}
