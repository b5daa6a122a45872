//! HTTP handlers for the edge proxy.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::{header, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::time::Duration;
use storage::CachedResponse;
use tile_common::{ProviderDescriptor, TileError};
use tracing::{debug, info, instrument, warn};

use crate::metrics;
use crate::state::ProxyState;
use crate::upstream::UpstreamError;

const X_CACHE: &str = "x-cache";

// ============================================================================
// Proxy
// ============================================================================

/// `GET /{provider}/{path...}?{query}`
#[instrument(skip(state, uri), fields(path = %uri.path()))]
pub async fn proxy_handler(
    Extension(state): Extension<Arc<ProxyState>>,
    Path((provider_id, rest)): Path<(String, String)>,
    uri: Uri,
) -> Response {
    let provider = match state.registry.get(&provider_id) {
        Ok(provider) => provider.clone(),
        Err(_) => return unknown_provider(&state, &provider_id),
    };
    if rest.trim_matches('/').is_empty() {
        return missing_path(&provider_id);
    }

    let url = upstream_url(&provider, &uri);

    if let Some(cached) = state.cache.get(&url).await {
        metrics::record_cache_hit(&provider.id);
        debug!(url = %url, "Edge cache hit");
        // Downstream caches may only keep what is left of the entry's lifetime
        return tile_response(cached.body, &cached.content_type, "HIT", cached.ttl.as_secs());
    }
    metrics::record_cache_miss(&provider.id);

    let upstream = match state.upstream.get(&url).await {
        Ok(upstream) => upstream,
        Err(e) => {
            let (status, kind) = match e {
                UpstreamError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
                UpstreamError::Transport(_) => (StatusCode::BAD_GATEWAY, "transport"),
            };
            metrics::record_upstream_error(&provider.id, kind);
            warn!(
                provider = %provider.id,
                upstream = %provider.host(),
                error = %e,
                "Upstream request failed"
            );
            return (status, format!("{}\n", e)).into_response();
        }
    };

    if !upstream.is_success() {
        metrics::record_upstream_error(&provider.id, "status");
        info!(
            provider = %provider.id,
            url = %url,
            status = upstream.status,
            "Passing through upstream error"
        );
        return passthrough(upstream.status, upstream.content_type, upstream.body);
    }

    let content_type = upstream
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());

    state
        .cache
        .insert(
            &url,
            CachedResponse {
                body: upstream.body.clone(),
                content_type: content_type.clone(),
                ttl: Duration::from_secs(provider.cache_ttl_secs),
            },
        )
        .await;
    metrics::record_cache_size(&state.cache);

    tile_response(upstream.body, &content_type, "MISS", provider.cache_ttl_secs)
}

/// Rebuild the upstream URL from the request: origin, the path after the
/// provider segment, and the raw query.
pub fn upstream_url(provider: &ProviderDescriptor, uri: &Uri) -> String {
    let rest = uri
        .path()
        .trim_start_matches('/')
        .split_once('/')
        .map(|(_, rest)| rest)
        .unwrap_or("");

    let mut url = format!("{}/{}", provider.origin.trim_end_matches('/'), rest);
    if let Some(query) = uri.query() {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn tile_response(body: Bytes, content_type: &str, cache_state: &'static str, ttl: u64) -> Response {
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(X_CACHE, HeaderValue::from_static(cache_state));
    if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={}", ttl)) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    response
}

fn passthrough(status: u16, content_type: Option<String>, body: Bytes) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = (status, body).into_response();
    let headers = response.headers_mut();
    if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(X_CACHE, HeaderValue::from_static("MISS"));
    response
}

fn unknown_provider(state: &ProxyState, provider_id: &str) -> Response {
    metrics::record_unknown_provider();
    let err = TileError::UnknownProvider(provider_id.to_string());
    let status = StatusCode::from_u16(err.http_status_code()).unwrap_or(StatusCode::NOT_FOUND);

    let mut body = format!("{}\nValid providers:\n", err);
    for id in state.registry.ids() {
        body.push_str("  ");
        body.push_str(&id);
        body.push('\n');
    }

    (status, body).into_response()
}

/// Any path that is not `/{provider}/{path}`.
pub async fn unknown_route_handler(
    Extension(state): Extension<Arc<ProxyState>>,
    uri: Uri,
) -> Response {
    let first = uri
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("");

    if state.registry.contains(first) {
        return missing_path(first);
    }
    unknown_provider(&state, first)
}

fn missing_path(provider_id: &str) -> Response {
    debug!(provider = %provider_id, "Request without upstream path");
    (
        StatusCode::NOT_FOUND,
        format!(
            "Missing upstream path for provider '{}'\nExpected /{}/{{path}}\n",
            provider_id, provider_id
        ),
    )
        .into_response()
}

// ============================================================================
// Health & metrics
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub upstreams: Vec<String>,
}

pub async fn health_handler(Extension(state): Extension<Arc<ProxyState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        upstreams: state.registry.ids(),
    })
}

pub async fn metrics_handler(
    Extension(state): Extension<Arc<ProxyState>>,
    Extension(handle): Extension<PrometheusHandle>,
) -> impl IntoResponse {
    metrics::record_cache_size(&state.cache);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}
