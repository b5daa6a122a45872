//! Tile prefetcher.
//!
//! Keeps a persistent local tile cache warm for a fixed area:
//! - Builds the canonical timeline for the selected layers
//! - Prefetches every frame within each provider's request budget
//! - Optionally routes requests through the shared edge proxy
//! - Purges tiles older than the maximum age after each cycle

mod warmer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use storage::LocalCache;
use tile_client::{CachedFetcher, HttpTileFetcher, PrefetchPlanner, PrefetchScheduler, SchedulerConfig};
use tile_common::{BoundingBox, LayerSet, ProviderRegistry, Viewport};
use tokio::sync::broadcast;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use warmer::{WarmTarget, Warmer};

const MAX_AGE_HOURS_LIMIT: i64 = 24 * 365;

#[derive(Parser, Debug)]
#[command(name = "prefetcher")]
#[command(about = "Keep a local weather tile cache warm")]
struct Args {
    /// Comma-separated provider ids to prefetch
    #[arg(long, env = "PREFETCH_PROVIDERS", default_value = "nexrad")]
    providers: String,

    /// Area to keep warm as "min_lon,min_lat,max_lon,max_lat"
    #[arg(long, env = "PREFETCH_BBOX", default_value = "-125,24,-66,50")]
    bbox: String,

    /// Requested zoom level, clamped per provider
    #[arg(long, env = "PREFETCH_ZOOM", default_value = "5")]
    zoom: u32,

    /// Local cache database
    #[arg(long, env = "CACHE_DB", default_value = "/data/tiles/cache.db")]
    cache_db: PathBuf,

    /// Edge proxy base URL; providers are contacted directly when unset
    #[arg(long, env = "PROXY_URL")]
    proxy_url: Option<String>,

    /// Tiles older than this are purged (1 hour to 1 year)
    #[arg(
        long,
        default_value = "2",
        value_parser = clap::value_parser!(i64).range(1..=MAX_AGE_HOURS_LIMIT)
    )]
    max_age_hours: i64,

    /// Seconds between cycles in continuous mode
    #[arg(long, default_value = "300")]
    refresh_secs: u64,

    /// Per-tile request timeout in seconds
    #[arg(long, default_value = "15")]
    tile_timeout_secs: u64,

    /// Provider table; the built-in table is used when the file is missing
    #[arg(long, env = "PROVIDERS_FILE", default_value = "config/providers.yaml")]
    providers_file: PathBuf,

    /// Run one cycle and exit
    #[arg(long)]
    once: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from .env file if present
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
        .with_target(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let registry = Arc::new(
        ProviderRegistry::load_or_default(&args.providers_file)
            .with_context(|| format!("Failed to load {}", args.providers_file.display()))?,
    );

    let layers = LayerSet::new(
        args.providers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty()),
    );
    for id in layers.iter() {
        if !registry.contains(id) {
            bail!("Unknown provider '{}', expected one of {:?}", id, registry.ids());
        }
    }

    let bounds = BoundingBox::parse(&args.bbox).context("Invalid --bbox")?;
    let viewport = Viewport::new(bounds, args.zoom);

    info!(
        providers = ?layers.iter().collect::<Vec<_>>(),
        bbox = %args.bbox,
        zoom = args.zoom,
        proxy = ?args.proxy_url,
        "Starting tile prefetcher"
    );

    let cache = LocalCache::open(&args.cache_db, chrono::Duration::hours(args.max_age_hours))
        .await
        .context("Failed to open local cache")?;

    let tile_timeout = Duration::from_secs(args.tile_timeout_secs);
    let http = HttpTileFetcher::new(tile_timeout).context("Failed to build HTTP client")?;
    let fetcher = Arc::new(CachedFetcher::new(http, cache.clone()));
    let scheduler = PrefetchScheduler::new(fetcher, SchedulerConfig { tile_timeout });

    let mut planner = PrefetchPlanner::new(registry);
    if let Some(proxy) = &args.proxy_url {
        planner = planner.with_proxy(proxy.clone());
    }

    let warmer = Warmer::new(
        planner,
        scheduler,
        cache,
        WarmTarget {
            layers,
            viewport,
            refresh: Duration::from_secs(args.refresh_secs),
        },
    );

    if args.once {
        info!("Running single warm-up cycle");
        warmer.run_once(Utc::now()).await?;
    } else {
        info!(refresh_secs = args.refresh_secs, "Starting continuous warm-up");

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Received shutdown signal");
            shutdown_tx.send(()).ok();
        });

        warmer.run_forever(shutdown_rx).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(max_age: &str) -> Result<Args, clap::Error> {
        Args::try_parse_from(["prefetcher", &format!("--max-age-hours={}", max_age)])
    }

    #[test]
    fn test_max_age_hours_range() {
        assert_eq!(parse("48").unwrap().max_age_hours, 48);
        assert_eq!(parse("8760").unwrap().max_age_hours, MAX_AGE_HOURS_LIMIT);

        for bad in ["0", "-3", "8761", "9223372036854775807"] {
            assert!(parse(bad).is_err(), "accepted --max-age-hours={}", bad);
        }
    }

    #[test]
    fn test_max_age_hours_default() {
        let args = Args::try_parse_from(["prefetcher"]).unwrap();
        assert_eq!(args.max_age_hours, 2);
    }
}
