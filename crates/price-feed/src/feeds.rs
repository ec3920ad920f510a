//! Upstream price sources
//!
//! A source streams observations for one instrument until it stops, then
//! reports at most one error explaining why.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use index_core::{Bar, Instrument, Price, SimulationConfig, SourceError};

use crate::clock::{Clock, SystemClock};

/// Buffer between a source task and its merge worker
const FEED_BUFFER: usize = 64;

/// Private observation stream plus one-slot error report of a source
#[derive(Debug)]
pub struct SourceFeed {
    pub updates: mpsc::Receiver<Bar>,
    pub error: oneshot::Receiver<SourceError>,
}

/// Producer half of a [`SourceFeed`]
#[derive(Debug)]
pub struct FeedSender {
    pub updates: mpsc::Sender<Bar>,
    error: oneshot::Sender<SourceError>,
}

impl FeedSender {
    /// Close the observation stream, then report why the source stopped.
    pub fn finish(self, error: Option<SourceError>) {
        drop(self.updates);
        if let Some(error) = error {
            // Nobody listening any more is fine
            let _ = self.error.send(error);
        }
    }
}

/// Create a connected feed pair
pub fn feed_channel(capacity: usize) -> (FeedSender, SourceFeed) {
    let (updates_tx, updates_rx) = mpsc::channel(capacity);
    let (error_tx, error_rx) = oneshot::channel();
    (
        FeedSender {
            updates: updates_tx,
            error: error_tx,
        },
        SourceFeed {
            updates: updates_rx,
            error: error_rx,
        },
    )
}

/// Base trait for price sources
#[async_trait::async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;

    /// Start streaming observations for `instrument`.
    ///
    /// The returned stream must eventually close; `shutdown` asks the
    /// source to stop early.
    async fn subscribe(&self, instrument: &Instrument, shutdown: CancellationToken) -> SourceFeed;
}

/// Send one observation, giving up on cancellation or a closed receiver.
///
/// Returns false when the source should stop.
async fn publish(tx: &mpsc::Sender<Bar>, bar: Bar, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        res = tx.send(bar) => res.is_ok(),
    }
}

/// Simulated exchange feed.
///
/// Emits a uniformly distributed price in `[base, base + spread)` once per
/// tick, then fails after its configured uptime.
pub struct SimulatedSource {
    name: String,
    config: SimulationConfig,
    seed: Option<u64>,
    clock: Arc<dyn Clock>,
}

impl SimulatedSource {
    pub fn new(name: impl Into<String>, config: SimulationConfig) -> Self {
        let seed = config.seed;
        Self {
            name: name.into(),
            config,
            seed,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// One source per configured provider, named `provider_<n>`
    pub fn from_config(config: &SimulationConfig) -> Vec<Arc<dyn PriceSource>> {
        (0..config.sources)
            .map(|i| {
                let mut source = SimulatedSource::new(format!("provider_{i}"), config.clone());
                source.seed = config.seed.map(|seed| seed.wrapping_add(i as u64));
                Arc::new(source) as Arc<dyn PriceSource>
            })
            .collect()
    }

    fn next_price(rng: &mut StdRng, base: Decimal, spread: Decimal) -> Decimal {
        // Draw in steps of 1e-8
        let steps = spread
            .checked_mul(Decimal::new(100_000_000, 0))
            .and_then(|s| s.trunc().to_i64())
            .unwrap_or(0);
        if steps <= 0 {
            return base;
        }
        base + Decimal::new(rng.random_range(0..steps), 8)
    }
}

#[async_trait::async_trait]
impl PriceSource for SimulatedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self, instrument: &Instrument, shutdown: CancellationToken) -> SourceFeed {
        let (sender, feed) = feed_channel(FEED_BUFFER);

        let name = self.name.clone();
        let instrument = instrument.clone();
        let clock = Arc::clone(&self.clock);
        let period = self.config.tick_interval();
        let uptime = self.config.uptime();
        let uptime_secs = self.config.uptime_secs;
        let base = self.config.base_price;
        let spread = self.config.price_spread;
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let stopped = sleep(uptime);
            tokio::pin!(stopped);

            let error = loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break SourceError::Cancelled(name.clone()),
                    _ = &mut stopped => {
                        break SourceError::UptimeExceeded {
                            source_name: name.clone(),
                            uptime_secs,
                        };
                    }
                    _ = ticker.tick() => {
                        let price = SimulatedSource::next_price(&mut rng, base, spread);
                        let bar = Bar::new(instrument.clone(), clock.now(), Price::from_decimal(price));
                        if !publish(&sender.updates, bar, &shutdown).await {
                            if shutdown.is_cancelled() {
                                break SourceError::Cancelled(name.clone());
                            }
                            debug!(source = %name, "Subscriber went away");
                            sender.finish(None);
                            return;
                        }
                    }
                }
            };

            info!(source = %name, "Source stopped: {}", error);
            sender.finish(Some(error));
        });

        feed
    }
}

/// Replays a fixed list of observations.
///
/// Useful for backfills and for driving the pipeline deterministically.
#[derive(Debug, Clone)]
pub struct StaticSource {
    name: String,
    bars: Vec<Bar>,
    start_delay: Duration,
    item_delay: Duration,
    hold_open: Duration,
    failure: Option<String>,
}

impl StaticSource {
    pub fn new(name: impl Into<String>, bars: Vec<Bar>) -> Self {
        Self {
            name: name.into(),
            bars,
            start_delay: Duration::ZERO,
            item_delay: Duration::ZERO,
            hold_open: Duration::ZERO,
            failure: None,
        }
    }

    /// Wait before the first observation
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Wait between observations
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }

    /// Keep the stream open for a while after the last observation
    pub fn with_hold_open(mut self, hold: Duration) -> Self {
        self.hold_open = hold;
        self
    }

    /// Report a disconnect once the replay is over
    pub fn failing_with(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }
}

#[async_trait::async_trait]
impl PriceSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self, _instrument: &Instrument, shutdown: CancellationToken) -> SourceFeed {
        let (sender, feed) = feed_channel(FEED_BUFFER);
        let source = self.clone();

        tokio::spawn(async move {
            let pause = |delay: Duration| {
                let shutdown = shutdown.clone();
                async move {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => false,
                        _ = sleep(delay) => true,
                    }
                }
            };

            let mut running = pause(source.start_delay).await;
            for (i, bar) in source.bars.into_iter().enumerate() {
                if running && i > 0 && !source.item_delay.is_zero() {
                    running = pause(source.item_delay).await;
                }
                if !running {
                    break;
                }
                running = publish(&sender.updates, bar, &shutdown).await;
            }
            if running {
                pause(source.hold_open).await;
            }

            let error = if shutdown.is_cancelled() {
                Some(SourceError::Cancelled(source.name.clone()))
            } else {
                source.failure.map(|reason| SourceError::Disconnected {
                    source_name: source.name.clone(),
                    reason,
                })
            };
            sender.finish(error);
        });

        feed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use chrono::{TimeZone, Utc};

    fn simulation(uptime_secs: u64) -> SimulationConfig {
        SimulationConfig {
            sources: 3,
            tick_interval_ms: 1000,
            uptime_secs,
            base_price: Decimal::new(98, 0),
            price_spread: Decimal::new(4, 0),
            seed: Some(7),
        }
    }

    #[test]
    fn test_from_config_names() {
        let sources = SimulatedSource::from_config(&simulation(10));
        let names: Vec<_> = sources.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["provider_0", "provider_1", "provider_2"]);
    }

    #[test]
    fn test_next_price_range() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = Decimal::new(98, 0);
        let spread = Decimal::new(4, 0);
        for _ in 0..1000 {
            let price = SimulatedSource::next_price(&mut rng, base, spread);
            assert!(price >= base && price < base + spread);
        }

        assert_eq!(SimulatedSource::next_price(&mut rng, base, Decimal::ZERO), base);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_source_fails_after_uptime() {
        let origin = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let source = SimulatedSource::new("provider_0", simulation(5))
            .with_clock(Arc::new(TokioClock::starting_at(origin)));
        let mut feed = source.subscribe(&Instrument::BTC_USD, CancellationToken::new()).await;

        let mut received = Vec::new();
        while let Some(bar) = feed.updates.recv().await {
            assert!(bar.price.parse().is_ok());
            received.push(bar);
        }

        // Ticks at 1s..4s; the 5s tick races the uptime deadline and loses
        assert_eq!(received.len(), 4);
        assert!(received.iter().all(|b| b.instrument == Instrument::BTC_USD));
        assert_eq!(received[0].timestamp, origin + chrono::TimeDelta::seconds(1));
        assert_eq!(
            feed.error.await.unwrap(),
            SourceError::UptimeExceeded {
                source_name: "provider_0".to_string(),
                uptime_secs: 5,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_source_cancellation() {
        let shutdown = CancellationToken::new();
        let source = SimulatedSource::new("provider_1", simulation(600));
        let mut feed = source.subscribe(&Instrument::BTC_USD, shutdown.clone()).await;

        assert!(feed.updates.recv().await.is_some());
        shutdown.cancel();

        while feed.updates.recv().await.is_some() {}
        assert_eq!(feed.error.await.unwrap(), SourceError::Cancelled("provider_1".to_string()));
    }

    #[tokio::test]
    async fn test_static_source_replays_then_fails() {
        let bars: Vec<_> = ["1", "2", "3"]
            .iter()
            .map(|p| Bar::new(Instrument::BTC_USD, Utc::now(), *p))
            .collect();
        let source = StaticSource::new("replay", bars.clone()).failing_with("socket reset");
        let mut feed = source.subscribe(&Instrument::BTC_USD, CancellationToken::new()).await;

        let mut received = Vec::new();
        while let Some(bar) = feed.updates.recv().await {
            received.push(bar);
        }
        assert_eq!(received, bars);

        let err = feed.error.await.unwrap();
        assert_eq!(err.source_name(), "replay");
        assert!(err.to_string().contains("socket reset"));
    }

    #[tokio::test]
    async fn test_static_source_clean_finish_leaves_error_slot_empty() {
        let source = StaticSource::new("replay", vec![]);
        let mut feed = source.subscribe(&Instrument::BTC_USD, CancellationToken::new()).await;

        assert!(feed.updates.recv().await.is_none());
        assert!(feed.error.await.is_err());
    }
}
