//! Streaming index price pipeline
//!
//! Features:
//! - Fan-in of any number of independent price sources
//! - Partial-failure tolerance: a failing source never stops the others
//! - Wall-clock aligned interval bars averaged in decimal arithmetic
//! - Cooperative cancellation at every suspension point

pub mod aggregator;
pub mod clock;
pub mod feeds;
pub mod merger;
pub mod pipeline;
pub mod state;

pub use aggregator::{AggregatorConfig, IntervalAggregator};
pub use clock::{Clock, SystemClock, TokioClock};
pub use feeds::{PriceSource, SimulatedSource, SourceFeed, StaticSource};
pub use merger::{FanInMerger, MergeHandle, MergeSummary, MergerConfig, Subscription};
pub use pipeline::IndexPriceFeed;
pub use state::{PipelineState, PipelineStats};
