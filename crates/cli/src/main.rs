//! Index price - merges many price sources into one bar per interval
//!
//! Main entry point: prints `Timestamp IndexPrice` lines to stdout

use std::env;
use std::io;

use anyhow::Context;
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use index_core::IndexConfig;
use index_price_cli::{wait_for_signal, write_bar, write_header, OutputFormat};
use index_price_feed::{IndexPriceFeed, SimulatedSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize logging, kept off stdout
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();

    info!("Starting index price v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = IndexConfig::load().context("failed to load configuration")?;
    let format: OutputFormat = match env::var("INDEX_OUTPUT") {
        Ok(value) => value.parse()?,
        Err(_) => OutputFormat::Text,
    };

    info!(
        "Instrument {}, interval {}s, {} simulated sources",
        config.instrument, config.interval_secs, config.simulation.sources
    );

    let sources = SimulatedSource::from_config(&config.simulation);
    let mut feed = IndexPriceFeed::new(config, sources);
    feed.start().await?;

    let mut bars = feed
        .take_bar_receiver()
        .context("bar stream already taken")?;

    // Stop the whole pipeline on Ctrl+C / SIGTERM
    let shutdown = feed.shutdown_token();
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });

    write_header(&mut io::stdout().lock(), format)?;
    while let Some(bar) = bars.next().await {
        write_bar(&mut io::stdout().lock(), &bar, format)?;
    }

    let summary = feed.wait().await;
    if summary.all_failed() {
        warn!("All {} sources failed", summary.failed.len());
    }

    let stats = feed.stats();
    info!(
        "Index price stopped: {} bars ({} empty), {} observations merged, {} dropped, {} malformed, {} out of range",
        stats.bars_emitted,
        stats.empty_bars,
        stats.observations_merged,
        stats.dropped(),
        stats.malformed_prices,
        stats.out_of_range_prices
    );

    Ok(())
}
