//! Edge cache proxy service.
//!
//! Sits in front of the public tile providers, keeps a bounded in-memory
//! cache of their responses and adds the CORS headers browsers need.

use anyhow::{Context, Result};
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tile_common::ProviderRegistry;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use edge_proxy::{config, HttpUpstream, ProxyConfig, ProxyState};

#[derive(Parser, Debug)]
#[command(name = "edge-proxy")]
#[command(about = "Caching CORS proxy for weather tile providers")]
struct Args {
    /// Listen address
    #[arg(short, long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8787")]
    listen: String,

    /// Comma-separated list of origins allowed to read responses
    #[arg(long, env = "ALLOWED_ORIGINS", default_value = "")]
    allowed_origins: String,

    /// Edge cache capacity in megabytes
    #[arg(long, env = "CACHE_SIZE_MB", default_value = "256")]
    cache_size_mb: usize,

    /// Upstream request timeout in seconds
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value = "15")]
    upstream_timeout_secs: u64,

    /// Provider table; the built-in table is used when the file is missing
    #[arg(long, env = "PROVIDERS_FILE", default_value = "config/providers.yaml")]
    providers_file: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let prometheus_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    let registry = Arc::new(
        ProviderRegistry::load_or_default(&args.providers_file)
            .with_context(|| format!("Failed to load {}", args.providers_file.display()))?,
    );

    let proxy_config = ProxyConfig {
        allowed_origins: config::parse_origins(&args.allowed_origins),
        cache_size_mb: args.cache_size_mb,
        upstream_timeout: Duration::from_secs(args.upstream_timeout_secs),
        ..ProxyConfig::default()
    };

    info!(
        providers = ?registry.ids(),
        allowed_origins = ?proxy_config.allowed_origins,
        cache_size_mb = proxy_config.cache_size_mb,
        upstream_timeout_secs = args.upstream_timeout_secs,
        "Starting edge proxy"
    );

    let upstream = HttpUpstream::new(proxy_config.upstream_timeout, &proxy_config.user_agent)
        .context("Failed to build HTTP client")?;
    let state = Arc::new(ProxyState::new(registry, Arc::new(upstream), &proxy_config));

    let app = edge_proxy::router(state, prometheus_handle);

    let addr: SocketAddr = args.listen.parse()?;
    info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    Ok(())
}
