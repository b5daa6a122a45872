//! Edge cache proxy library.
//!
//! Exposes the router and its parts so the binary and the integration tests
//! share one construction path.

pub mod config;
pub mod cors;
pub mod handlers;
pub mod metrics;
pub mod state;
pub mod upstream;

use std::sync::Arc;

use axum::{extract::Extension, middleware, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

pub use config::ProxyConfig;
pub use cors::CorsPolicy;
pub use state::ProxyState;
pub use upstream::{HttpUpstream, Upstream, UpstreamError, UpstreamResponse};

/// Build the proxy router.
///
/// `/health` and `/metrics` are served locally; every other
/// `/{provider}/{path}` is proxied. Unmatched paths get the provider listing.
pub fn router(state: Arc<ProxyState>, prometheus: PrometheusHandle) -> Router {
    let cors = state.cors.clone();

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/:provider/*path", get(handlers::proxy_handler))
        .fallback(handlers::unknown_route_handler)
        .layer(Extension(state))
        .layer(Extension(prometheus))
        .layer(middleware::from_fn(cors::cors_middleware))
        .layer(Extension(cors))
        .layer(TraceLayer::new_for_http())
}
