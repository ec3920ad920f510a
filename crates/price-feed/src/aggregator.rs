//! Interval aggregator - turns the merged stream into one bar per interval
//!
//! The aggregator first waits for the next interval boundary, discarding
//! whatever arrives meanwhile. From then on a timer armed at the end of the
//! current bucket competes with incoming observations. The timer always wins
//! a tie, so a flood of observations can delay an emission by at most one
//! processed item.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use index_core::{average_price, bucket_start, Bar, CoreError, CoreResult, IndexConfig, Instrument};

use crate::clock::{Clock, SystemClock};
use crate::merger::Subscription;
use crate::state::{DropReason, PipelineState};

/// Aggregator configuration
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub interval: Duration,
    pub channel_capacity: usize,
    /// Number of buckets after the current one that may hold early observations
    pub max_lookahead_buckets: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            channel_capacity: 1024,
            max_lookahead_buckets: 1,
        }
    }
}

impl From<&IndexConfig> for AggregatorConfig {
    fn from(config: &IndexConfig) -> Self {
        Self {
            interval: config.interval(),
            channel_capacity: config.channel_capacity,
            max_lookahead_buckets: config.max_lookahead_buckets,
        }
    }
}

/// Where an observation belongs relative to the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Stale,
    Bucket(DateTime<Utc>),
    TooFarAhead,
}

/// The bucket being accumulated and the lookahead horizon after it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketWindow {
    pub current: DateTime<Utc>,
    pub next: DateTime<Utc>,
    interval: TimeDelta,
    lookahead: u32,
}

impl BucketWindow {
    pub fn new(current: DateTime<Utc>, interval: TimeDelta, lookahead: u32) -> Self {
        Self {
            current,
            next: current + interval,
            interval,
            lookahead: lookahead.max(1),
        }
    }

    pub fn classify(&self, timestamp: DateTime<Utc>) -> Placement {
        if timestamp < self.current {
            return Placement::Stale;
        }
        if timestamp < self.next {
            return Placement::Bucket(self.current);
        }

        let mut start = self.next;
        for _ in 0..self.lookahead {
            let end = start + self.interval;
            if timestamp < end {
                return Placement::Bucket(start);
            }
            start = end;
        }
        Placement::TooFarAhead
    }

    pub fn advance(&mut self) {
        self.current = self.next;
        self.next = self.current + self.interval;
    }
}

/// Averages the merged stream into fixed, wall-clock aligned intervals
pub struct IntervalAggregator {
    config: AggregatorConfig,
    clock: Arc<dyn Clock>,
    state: Arc<PipelineState>,
}

impl IntervalAggregator {
    pub fn new(config: AggregatorConfig, state: Arc<PipelineState>) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            state,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start aggregating `upstream` on a new task.
    ///
    /// The returned subscription closes when `upstream` closes or `shutdown`
    /// is cancelled. The bucket in progress at that point is not emitted.
    pub fn spawn(
        self,
        upstream: Subscription,
        shutdown: CancellationToken,
    ) -> CoreResult<(Subscription, JoinHandle<()>)> {
        let interval = TimeDelta::from_std(self.config.interval)
            .map_err(|e| CoreError::InvalidInterval(e.to_string()))?;
        if interval <= TimeDelta::zero() {
            return Err(CoreError::InvalidInterval(format!(
                "{:?} is not positive",
                self.config.interval
            )));
        }

        let (instrument, updates) = upstream.into_parts();
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));

        let run = AggregatorRun {
            instrument: instrument.clone(),
            interval,
            lookahead: self.config.max_lookahead_buckets,
            clock: self.clock,
            state: self.state,
            updates,
            output: tx,
            shutdown,
            buckets: BTreeMap::new(),
        };
        let handle = tokio::spawn(run.run());

        Ok((Subscription::new(instrument, rx), handle))
    }
}

/// State owned by the aggregator task
struct AggregatorRun {
    instrument: Instrument,
    interval: TimeDelta,
    lookahead: u32,
    clock: Arc<dyn Clock>,
    state: Arc<PipelineState>,
    updates: mpsc::Receiver<Bar>,
    output: mpsc::Sender<Bar>,
    shutdown: CancellationToken,
    /// Accumulated observations keyed by bucket start
    buckets: BTreeMap<DateTime<Utc>, Vec<Bar>>,
}

impl AggregatorRun {
    async fn run(mut self) {
        let first = match bucket_start(self.clock.now(), self.interval) {
            Ok(start) => start + self.interval,
            Err(e) => {
                error!("Cannot align {} to interval: {}", self.instrument, e);
                return;
            }
        };

        if !self.prime(first).await {
            return;
        }
        info!("Aggregating {} from {} every {}s", self.instrument, first, self.interval.num_seconds());

        let mut window = BucketWindow::new(first, self.interval, self.lookahead);
        let timer = sleep_until(self.clock.deadline(window.next));
        tokio::pin!(timer);

        loop {
            // A fired timer is served before looking at the queue again
            if timer.is_elapsed() {
                if !self.emit(&mut window).await {
                    return;
                }
                timer.as_mut().reset(self.clock.deadline(window.next));
                continue;
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Aggregator for {} cancelled", self.instrument);
                    return;
                }
                _ = &mut timer => {
                    if !self.emit(&mut window).await {
                        return;
                    }
                    timer.as_mut().reset(self.clock.deadline(window.next));
                }
                update = self.updates.recv() => match update {
                    Some(bar) => self.accumulate(&window, bar),
                    None => {
                        info!("Upstream for {} closed, stopping aggregator", self.instrument);
                        return;
                    }
                },
            }
        }
    }

    /// Wait for the first boundary, discarding observations.
    ///
    /// Returns false if the pipeline ended meanwhile.
    async fn prime(&mut self, first: DateTime<Utc>) -> bool {
        let boundary = sleep_until(self.clock.deadline(first));
        tokio::pin!(boundary);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return false,
                _ = &mut boundary => return true,
                update = self.updates.recv() => match update {
                    Some(_) => self.state.record_dropped(DropReason::Priming),
                    None => {
                        info!("Upstream for {} closed before the first interval", self.instrument);
                        return false;
                    }
                },
            }
        }
    }

    fn accumulate(&mut self, window: &BucketWindow, bar: Bar) {
        match window.classify(bar.timestamp) {
            Placement::Bucket(start) => {
                self.state.record_accepted();
                self.buckets.entry(start).or_default().push(bar);
            }
            Placement::Stale => {
                debug!("Dropping stale observation at {} (bucket {})", bar.timestamp, window.current);
                self.state.record_dropped(DropReason::Stale);
            }
            Placement::TooFarAhead => {
                debug!("Dropping observation at {} beyond the lookahead horizon", bar.timestamp);
                self.state.record_dropped(DropReason::TooFarAhead);
            }
        }
    }

    /// Emit the current bucket and move the window on.
    ///
    /// Returns false if nobody can receive bars any more.
    async fn emit(&mut self, window: &mut BucketWindow) -> bool {
        let observations = self.buckets.remove(&window.current).unwrap_or_default();
        let averaged = average_price(&observations);
        if averaged.rejected > 0 {
            warn!(
                "Ignored {} malformed prices in {} bucket {}",
                averaged.rejected, self.instrument, window.current
            );
            self.state.record_malformed(averaged.rejected);
        }
        if averaged.out_of_range > 0 {
            warn!(
                "Ignored {} out of range prices in {} bucket {}",
                averaged.out_of_range, self.instrument, window.current
            );
            self.state.record_out_of_range(averaged.out_of_range);
        }

        let bar = Bar::new(self.instrument.clone(), window.current, averaged.price);
        let sent = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            res = self.output.send(bar.clone()) => res.is_ok(),
        };
        if !sent {
            debug!("Bar consumer for {} went away", self.instrument);
            return false;
        }

        self.state.record_bar(&bar);
        window.advance();
        true
    }
}
