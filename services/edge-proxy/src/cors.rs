//! Per-request CORS decisions from an origin allow-list.
//!
//! - allow-listed `Origin` is echoed back with `Vary: Origin`
//! - no `Origin` header gets `*`
//! - an unlisted origin gets no allow-origin header at all
//!
//! Credentials are never allowed, so `*` is always safe to send.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{Extension, Request},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct CorsPolicy {
    allowed: Arc<HashSet<String>>,
    allow_any: bool,
}

impl CorsPolicy {
    /// A `*` entry in the list admits every origin.
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed: HashSet<String> = origins.into_iter().map(Into::into).collect();
        Self {
            allow_any: allowed.contains("*"),
            allowed: Arc::new(allowed),
        }
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        self.allow_any || self.allowed.contains(origin)
    }

    /// Add the CORS response headers for a request carrying `origin`.
    pub fn apply(&self, origin: Option<&HeaderValue>, headers: &mut HeaderMap) {
        match origin {
            None => {
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_ORIGIN,
                    HeaderValue::from_static("*"),
                );
            }
            Some(value) => {
                headers.append(header::VARY, HeaderValue::from_static("origin"));
                let allowed = value.to_str().map(|o| self.is_allowed(o)).unwrap_or(false);
                if allowed {
                    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value.clone());
                } else {
                    debug!(origin = ?value, "Origin not in allow-list");
                }
            }
        }
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static("x-cache"),
        );
    }
}

/// Answers preflights with 204 and decorates every other response.
pub async fn cors_middleware(
    Extension(policy): Extension<CorsPolicy>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request.headers().get(header::ORIGIN).cloned();

    if request.method() == Method::OPTIONS {
        let requested_headers = request
            .headers()
            .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
            .cloned();

        let mut response = StatusCode::NO_CONTENT.into_response();
        let headers = response.headers_mut();
        policy.apply(origin.as_ref(), headers);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            requested_headers.unwrap_or_else(|| HeaderValue::from_static("*")),
        );
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static("86400"),
        );
        return response;
    }

    let mut response = next.run(request).await;
    policy.apply(origin.as_ref(), response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CorsPolicy {
        CorsPolicy::new(["https://viewer.example"])
    }

    #[test]
    fn test_listed_origin_echoed() {
        let mut headers = HeaderMap::new();
        let origin = HeaderValue::from_static("https://viewer.example");
        policy().apply(Some(&origin), &mut headers);

        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://viewer.example");
        assert_eq!(headers[header::VARY], "origin");
    }

    #[test]
    fn test_absent_origin_gets_wildcard() {
        let mut headers = HeaderMap::new();
        policy().apply(None, &mut headers);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());
    }

    #[test]
    fn test_unlisted_origin_gets_nothing() {
        let mut headers = HeaderMap::new();
        let origin = HeaderValue::from_static("https://evil.example");
        policy().apply(Some(&origin), &mut headers);
        assert!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[test]
    fn test_star_entry_admits_all() {
        let policy = CorsPolicy::new(["*"]);
        assert!(policy.is_allowed("https://anything.example"));
    }
}
