//! Shared pipeline counters and the latest index price
//!
//! Written by the merge workers and the aggregator task, read by anyone
//! holding the `Arc`. Counters are lock-free; the latest bar sits behind a
//! short-lived `RwLock`.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use index_core::Bar;

/// Why an observation never reached a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Arrived before the first interval boundary was reached
    Priming,
    /// Older than the bucket being accumulated
    Stale,
    /// Beyond the lookahead horizon
    TooFarAhead,
}

/// Latest emitted bar with the time it was published
#[derive(Debug, Clone)]
pub struct BarEntry {
    pub bar: Bar,
    pub published_at: Instant,
}

impl BarEntry {
    pub fn age(&self) -> Duration {
        self.published_at.elapsed()
    }
}

/// Pipeline state shared between stages
#[derive(Debug, Default)]
pub struct PipelineState {
    observations_merged: AtomicU64,
    observations_accepted: AtomicU64,
    dropped_priming: AtomicU64,
    dropped_stale: AtomicU64,
    dropped_ahead: AtomicU64,
    malformed_prices: AtomicU64,
    out_of_range_prices: AtomicU64,
    bars_emitted: AtomicU64,
    empty_bars: AtomicU64,
    sources_completed: AtomicU64,
    sources_failed: AtomicU64,
    latest_bar: RwLock<Option<BarEntry>>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_merged(&self) {
        self.observations_merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.observations_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Priming => &self.dropped_priming,
            DropReason::Stale => &self.dropped_stale,
            DropReason::TooFarAhead => &self.dropped_ahead,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self, count: usize) {
        self.malformed_prices.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_out_of_range(&self, count: usize) {
        self.out_of_range_prices.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record an emitted bar and make it the latest index price
    pub fn record_bar(&self, bar: &Bar) {
        self.bars_emitted.fetch_add(1, Ordering::Relaxed);
        if !bar.has_price() {
            self.empty_bars.fetch_add(1, Ordering::Relaxed);
        }
        *self.latest_bar.write() = Some(BarEntry {
            bar: bar.clone(),
            published_at: Instant::now(),
        });
    }

    pub fn record_source_finished(&self, failed: bool) {
        if failed {
            self.sources_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sources_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Most recently emitted bar
    pub fn latest_bar(&self) -> Option<BarEntry> {
        self.latest_bar.read().clone()
    }

    /// Stats
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            observations_merged: self.observations_merged.load(Ordering::Relaxed),
            observations_accepted: self.observations_accepted.load(Ordering::Relaxed),
            dropped_priming: self.dropped_priming.load(Ordering::Relaxed),
            dropped_stale: self.dropped_stale.load(Ordering::Relaxed),
            dropped_ahead: self.dropped_ahead.load(Ordering::Relaxed),
            malformed_prices: self.malformed_prices.load(Ordering::Relaxed),
            out_of_range_prices: self.out_of_range_prices.load(Ordering::Relaxed),
            bars_emitted: self.bars_emitted.load(Ordering::Relaxed),
            empty_bars: self.empty_bars.load(Ordering::Relaxed),
            sources_completed: self.sources_completed.load(Ordering::Relaxed),
            sources_failed: self.sources_failed.load(Ordering::Relaxed),
            last_bar_age: self.latest_bar.read().as_ref().map(BarEntry::age),
        }
    }
}

/// Statistics about the pipeline
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub observations_merged: u64,
    pub observations_accepted: u64,
    pub dropped_priming: u64,
    pub dropped_stale: u64,
    pub dropped_ahead: u64,
    pub malformed_prices: u64,
    pub out_of_range_prices: u64,
    pub bars_emitted: u64,
    pub empty_bars: u64,
    pub sources_completed: u64,
    pub sources_failed: u64,
    pub last_bar_age: Option<Duration>,
}

impl PipelineStats {
    pub fn dropped(&self) -> u64 {
        self.dropped_priming + self.dropped_stale + self.dropped_ahead
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use index_core::Instrument;

    #[test]
    fn test_record_bar() {
        let state = PipelineState::new();
        assert!(state.latest_bar().is_none());
        assert!(state.stats().last_bar_age.is_none());

        state.record_bar(&Bar::new(Instrument::BTC_USD, Utc::now(), ""));
        state.record_bar(&Bar::new(Instrument::BTC_USD, Utc::now(), "101.5"));

        let stats = state.stats();
        assert_eq!(stats.bars_emitted, 2);
        assert_eq!(stats.empty_bars, 1);
        assert!(stats.last_bar_age.is_some());
        assert_eq!(state.latest_bar().unwrap().bar.price.as_str(), "101.5");
    }

    #[test]
    fn test_drop_reasons() {
        let state = PipelineState::new();
        state.record_dropped(DropReason::Priming);
        state.record_dropped(DropReason::Stale);
        state.record_dropped(DropReason::Stale);
        state.record_dropped(DropReason::TooFarAhead);

        let stats = state.stats();
        assert_eq!(stats.dropped_priming, 1);
        assert_eq!(stats.dropped_stale, 2);
        assert_eq!(stats.dropped_ahead, 1);
        assert_eq!(stats.dropped(), 4);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let state = Arc::new(PipelineState::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    for _ in 0..100 {
                        state.record_merged();
                    }
                    state.record_source_finished(i % 2 == 0);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let stats = state.stats();
        assert_eq!(stats.observations_merged, 400);
        assert_eq!(stats.sources_failed, 2);
        assert_eq!(stats.sources_completed, 2);
    }
}
