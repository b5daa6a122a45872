//! Shared helpers for proxy integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use edge_proxy::{ProxyConfig, ProxyState, Upstream, UpstreamError, UpstreamResponse};
use metrics_exporter_prometheus::PrometheusBuilder;
use tile_common::ProviderRegistry;

/// Canned upstream: fixed answers per URL, 200 PNG for anything else.
#[derive(Default)]
pub struct MockUpstream {
    responses: Mutex<HashMap<String, Result<UpstreamResponse, UpstreamError>>>,
    requested: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl MockUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, url: &str, response: Result<UpstreamResponse, UpstreamError>) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn get(&self, url: &str) -> Result<UpstreamResponse, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(url.to_string());

        self.responses
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| Ok(png(url)))
    }
}

/// A 200 image/png response whose body names the URL.
pub fn png(url: &str) -> UpstreamResponse {
    UpstreamResponse {
        status: 200,
        content_type: Some("image/png".to_string()),
        body: Bytes::from(format!("png:{}", url)),
    }
}

pub fn build_router(upstream: Arc<MockUpstream>, allowed_origins: &[&str]) -> Router {
    let config = ProxyConfig {
        allowed_origins: allowed_origins.iter().map(|s| s.to_string()).collect(),
        ..ProxyConfig::default()
    };
    let state = Arc::new(ProxyState::new(
        Arc::new(ProviderRegistry::builtin()),
        upstream,
        &config,
    ));
    let handle = PrometheusBuilder::new().build_recorder().handle();
    edge_proxy::router(state, handle)
}
