//! Index price feed - wires sources, merger and aggregator together

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use index_core::IndexConfig;

use crate::aggregator::{AggregatorConfig, IntervalAggregator};
use crate::clock::{Clock, SystemClock};
use crate::feeds::PriceSource;
use crate::merger::{FanInMerger, MergeHandle, MergeSummary, MergerConfig, Subscription};
use crate::state::{PipelineState, PipelineStats};

/// Main index price feed
pub struct IndexPriceFeed {
    config: IndexConfig,
    sources: Vec<Arc<dyn PriceSource>>,
    clock: Arc<dyn Clock>,
    state: Arc<PipelineState>,
    shutdown: CancellationToken,
    bar_rx: Option<Subscription>,
    merge: Option<MergeHandle>,
    aggregator: Option<JoinHandle<()>>,
}

impl IndexPriceFeed {
    pub fn new(config: IndexConfig, sources: Vec<Arc<dyn PriceSource>>) -> Self {
        Self {
            config,
            sources,
            clock: Arc::new(SystemClock),
            state: Arc::new(PipelineState::new()),
            shutdown: CancellationToken::new(),
            bar_rx: None,
            merge: None,
            aggregator: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Token that stops the whole pipeline when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Get bar receiver (can only be taken once, after `start`)
    pub fn take_bar_receiver(&mut self) -> Option<Subscription> {
        self.bar_rx.take()
    }

    /// Start merging and aggregating
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.aggregator.is_some() {
            bail!("Index price feed for {} already started", self.config.instrument);
        }
        self.config.validate().context("invalid index price configuration")?;
        if self.sources.is_empty() {
            bail!("Index price feed for {} has no price sources", self.config.instrument);
        }

        info!(
            "Starting index price feed for {} with {} sources",
            self.config.instrument,
            self.sources.len()
        );

        let merger = FanInMerger::new(MergerConfig::from(&self.config), Arc::clone(&self.state));
        let (merged, merge) = merger.subscribe(
            self.config.instrument.clone(),
            self.sources.clone(),
            self.shutdown.clone(),
        );

        let aggregator = IntervalAggregator::new(
            AggregatorConfig::from(&self.config),
            Arc::clone(&self.state),
        )
        .with_clock(Arc::clone(&self.clock));
        let (bars, handle) = match aggregator.spawn(merged, self.shutdown.clone()) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.shutdown.cancel();
                return Err(e).context("failed to start interval aggregator");
            }
        };

        self.bar_rx = Some(bars);
        self.merge = Some(merge);
        self.aggregator = Some(handle);
        Ok(())
    }

    /// Stop all stages
    pub fn stop(&self) {
        info!("Stopping index price feed for {}", self.config.instrument);
        self.shutdown.cancel();
    }

    /// Check if running
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
            && self.aggregator.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Wait for both stages to finish and report how the sources ended
    pub async fn wait(&mut self) -> MergeSummary {
        if let Some(handle) = self.aggregator.take() {
            if let Err(e) = handle.await {
                error!("Aggregator task failed: {}", e);
            }
        }
        match self.merge.take() {
            Some(merge) => merge.join().await,
            None => MergeSummary::default(),
        }
    }

    /// Get statistics
    pub fn stats(&self) -> PipelineStats {
        self.state.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::feeds::StaticSource;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use index_core::{Bar, Instrument};
    use std::time::Duration;

    fn at(m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, m, s).unwrap()
    }

    fn source(name: &str, prices: &[(DateTime<Utc>, &str)]) -> StaticSource {
        let bars = prices
            .iter()
            .map(|(ts, p)| Bar::new(Instrument::BTC_USD, *ts, *p))
            .collect();
        StaticSource::new(name, bars)
    }

    #[tokio::test]
    async fn test_feed_creation() {
        let feed = IndexPriceFeed::new(IndexConfig::default(), vec![]);

        assert!(!feed.is_running());
        assert_eq!(feed.stats().bars_emitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_index_price() {
        let config = IndexConfig {
            source_error_wait_ms: 10,
            ..Default::default()
        };

        // Clock starts at 12:00:30; sources start talking at 12:01:05
        let sources: Vec<Arc<dyn PriceSource>> = vec![
            Arc::new(
                source("a", &[(at(1, 5), "100"), (at(1, 50), "104"), (at(2, 10), "200")])
                    .with_start_delay(Duration::from_secs(35))
                    .with_hold_open(Duration::from_secs(120)),
            ),
            Arc::new(
                source("b", &[(at(1, 6), "102"), (at(0, 59), "1")])
                    .with_start_delay(Duration::from_secs(35))
                    .failing_with("exchange maintenance"),
            ),
        ];

        let mut feed = IndexPriceFeed::new(config, sources)
            .with_clock(Arc::new(TokioClock::starting_at(at(0, 30))));
        feed.start().await.unwrap();
        assert!(feed.is_running());
        assert!(feed.start().await.is_err());

        let mut bars = feed.take_bar_receiver().unwrap();
        assert!(feed.take_bar_receiver().is_none());
        assert_eq!(bars.instrument(), &Instrument::BTC_USD);

        let mut received = Vec::new();
        while let Some(bar) = bars.recv().await {
            received.push(bar);
        }

        // Source "a" holds its stream open until ~12:03:05
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].timestamp, at(1, 0));
        assert_eq!(received[0].price.as_str(), "102");
        assert_eq!(received[1].timestamp, at(2, 0));
        assert_eq!(received[1].price.as_str(), "200");
        assert_eq!(received[1].timestamp - received[0].timestamp, TimeDelta::seconds(60));

        let summary = feed.wait().await;
        assert_eq!(summary.completed, vec!["a".to_string()]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].source, "b");

        let stats = feed.stats();
        assert_eq!(stats.observations_merged, 5);
        assert_eq!(stats.dropped_stale, 1);
        assert_eq!(stats.bars_emitted, 2);
        assert!(!feed.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_tears_down_pipeline() {
        let sources: Vec<Arc<dyn PriceSource>> = vec![Arc::new(
            source("a", &[]).with_hold_open(Duration::from_secs(3600)),
        )];

        let mut feed = IndexPriceFeed::new(IndexConfig::default(), sources)
            .with_clock(Arc::new(TokioClock::starting_at(at(0, 30))));
        feed.start().await.unwrap();
        let mut bars = feed.take_bar_receiver().unwrap();

        let first = bars.recv().await.unwrap();
        assert_eq!(first.timestamp, at(1, 0));
        assert!(first.price.is_empty());

        feed.stop();
        assert!(bars.recv().await.is_none());
        assert!(!feed.is_running());

        let summary = feed.wait().await;
        assert_eq!(summary.cancelled, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = IndexConfig {
            interval_secs: 0,
            ..Default::default()
        };
        let mut feed = IndexPriceFeed::new(config, vec![]);
        assert!(feed.start().await.is_err());
        assert!(feed.take_bar_receiver().is_none());
    }

    #[tokio::test]
    async fn test_start_requires_a_source() {
        let mut feed = IndexPriceFeed::new(IndexConfig::default(), vec![]);
        let err = feed.start().await.unwrap_err();
        assert!(err.to_string().contains("no price sources"));
        assert!(feed.take_bar_receiver().is_none());
        assert!(!feed.is_running());
    }
}
