//! Fan-in merge of many price sources into one stream
//!
//! One worker task per source forwards that source's observations into a
//! shared queue. A coordinator task owns the original sender: it waits for
//! every worker to finish and then drops it, which closes the merged stream
//! exactly once.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use index_core::{Bar, IndexConfig, Instrument, SourceError};

use crate::feeds::{PriceSource, SourceFeed};
use crate::state::PipelineState;

/// Ordered stream of bars for one instrument.
///
/// Ends when the producing stage closes it; there is no sentinel value.
#[derive(Debug)]
pub struct Subscription {
    instrument: Instrument,
    updates: mpsc::Receiver<Bar>,
}

impl Subscription {
    pub fn new(instrument: Instrument, updates: mpsc::Receiver<Bar>) -> Self {
        Self { instrument, updates }
    }

    /// Instrument this subscription serves
    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Next bar, `None` once the stream is closed
    pub async fn recv(&mut self) -> Option<Bar> {
        self.updates.recv().await
    }

    pub fn into_parts(self) -> (Instrument, mpsc::Receiver<Bar>) {
        (self.instrument, self.updates)
    }
}

impl Stream for Subscription {
    type Item = Bar;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bar>> {
        self.updates.poll_recv(cx)
    }
}

/// A source that stopped with an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub source: String,
    pub error: SourceError,
}

/// How every source of a merge ended
#[derive(Debug, Clone, Default)]
pub struct MergeSummary {
    pub completed: Vec<String>,
    pub cancelled: Vec<String>,
    pub failed: Vec<SourceFailure>,
}

impl MergeSummary {
    pub fn total(&self) -> usize {
        self.completed.len() + self.cancelled.len() + self.failed.len()
    }

    /// Every source ended in failure
    pub fn all_failed(&self) -> bool {
        !self.failed.is_empty() && self.completed.is_empty() && self.cancelled.is_empty()
    }
}

/// Outcome of one forwarding worker
#[derive(Debug)]
enum WorkerOutcome {
    Completed(String),
    Cancelled(String),
    Failed(SourceFailure),
}

/// Handle on the merge coordinator
#[derive(Debug)]
pub struct MergeHandle {
    task: JoinHandle<MergeSummary>,
}

impl MergeHandle {
    /// Wait until the merged stream has been closed
    pub async fn join(self) -> MergeSummary {
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => {
                error!("Merge coordinator failed: {}", e);
                MergeSummary::default()
            }
        }
    }
}

/// Merger configuration
#[derive(Debug, Clone)]
pub struct MergerConfig {
    pub channel_capacity: usize,
    /// How long to wait for a source's error report after its stream closed
    pub error_wait: Duration,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            error_wait: Duration::from_secs(1),
        }
    }
}

impl From<&IndexConfig> for MergerConfig {
    fn from(config: &IndexConfig) -> Self {
        Self {
            channel_capacity: config.channel_capacity,
            error_wait: config.source_error_wait(),
        }
    }
}

/// Merges the observation streams of many sources
pub struct FanInMerger {
    config: MergerConfig,
    state: Arc<PipelineState>,
}

impl FanInMerger {
    pub fn new(config: MergerConfig, state: Arc<PipelineState>) -> Self {
        Self { config, state }
    }

    /// Subscribe to every source and merge their streams.
    ///
    /// Must be called inside a tokio runtime.
    pub fn subscribe(
        &self,
        instrument: Instrument,
        sources: Vec<Arc<dyn PriceSource>>,
        shutdown: CancellationToken,
    ) -> (Subscription, MergeHandle) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));

        if sources.is_empty() {
            warn!("No price sources configured for {}", instrument);
        }
        info!("Merging {} sources for {}", sources.len(), instrument);

        let mut workers = JoinSet::new();
        // Sources whose worker has not reported yet
        let mut pending: Vec<String> = sources.iter().map(|s| s.name().to_string()).collect();
        for source in sources {
            workers.spawn(forward(
                source,
                instrument.clone(),
                tx.clone(),
                shutdown.clone(),
                self.config.error_wait,
                Arc::clone(&self.state),
            ));
        }

        let state = Arc::clone(&self.state);
        let served = instrument.clone();
        let task = tokio::spawn(async move {
            let mut summary = MergeSummary::default();
            let mut aborted = Vec::new();

            while let Some(res) = workers.join_next().await {
                let outcome = match res {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("Merge worker for {} aborted: {}", served, e);
                        aborted.push(e.to_string());
                        continue;
                    }
                };
                let name = match &outcome {
                    WorkerOutcome::Completed(name) | WorkerOutcome::Cancelled(name) => name,
                    WorkerOutcome::Failed(failure) => &failure.source,
                };
                if let Some(pos) = pending.iter().position(|p| p == name) {
                    pending.swap_remove(pos);
                }
                match outcome {
                    WorkerOutcome::Completed(name) => {
                        state.record_source_finished(false);
                        summary.completed.push(name);
                    }
                    WorkerOutcome::Cancelled(name) => {
                        state.record_source_finished(false);
                        summary.cancelled.push(name);
                    }
                    WorkerOutcome::Failed(failure) => {
                        state.record_source_finished(true);
                        summary.failed.push(failure);
                    }
                }
            }

            // A panicked worker cannot name itself; it is one of those never heard from
            for (source, reason) in pending.into_iter().zip(aborted) {
                state.record_source_finished(true);
                summary.failed.push(SourceFailure {
                    error: SourceError::Aborted {
                        source_name: source.clone(),
                        reason,
                    },
                    source,
                });
            }

            // Workers' clones are gone; this closes the merged stream
            drop(tx);

            info!(
                "Merged stream for {} closed: {} completed, {} cancelled, {} failed",
                served,
                summary.completed.len(),
                summary.cancelled.len(),
                summary.failed.len()
            );
            summary
        });

        (Subscription::new(instrument, rx), MergeHandle { task })
    }
}

/// Drain one source into the merged stream, then read its error slot
async fn forward(
    source: Arc<dyn PriceSource>,
    instrument: Instrument,
    tx: mpsc::Sender<Bar>,
    shutdown: CancellationToken,
    error_wait: Duration,
    state: Arc<PipelineState>,
) -> WorkerOutcome {
    let name = source.name().to_string();

    let feed = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return WorkerOutcome::Cancelled(name),
        feed = source.subscribe(&instrument, shutdown.child_token()) => feed,
    };
    let SourceFeed { mut updates, error } = feed;

    loop {
        let bar = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return WorkerOutcome::Cancelled(name),
            bar = updates.recv() => bar,
        };
        let Some(bar) = bar else {
            break;
        };

        let sent = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return WorkerOutcome::Cancelled(name),
            res = tx.send(bar) => res.is_ok(),
        };
        if !sent {
            debug!(source = %name, "Merged stream closed by consumer");
            break;
        }
        state.record_merged();
    }
    drop(updates);

    match timeout(error_wait, error).await {
        Ok(Ok(SourceError::Cancelled(_))) => WorkerOutcome::Cancelled(name),
        Ok(Ok(err)) => {
            warn!(source = %name, "Price source failed: {}", err);
            WorkerOutcome::Failed(SourceFailure { source: name, error: err })
        }
        Ok(Err(_)) => {
            debug!(source = %name, "Price source finished");
            WorkerOutcome::Completed(name)
        }
        Err(_) => {
            debug!(source = %name, "No error report within {:?}", error_wait);
            WorkerOutcome::Completed(name)
        }
    }
}
