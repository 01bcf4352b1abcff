use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures::{StreamExt, stream::FuturesUnordered};
use indicatif::ProgressBar;
use tokio::time::sleep;

use crate::{
    config::FanoutConfig,
    expander::{ExpansionState, RegistryQueryExpander, SearchReport},
    postal::PostalCode,
};

/// Resolves a frontier of postal codes in fixed-size concurrent batches.
///
/// Batches run strictly one after another, separated by the configured
/// delay; overflowing codes found in one pass form the next pass.
pub struct ParallelFanoutClient {
    expander: Arc<RegistryQueryExpander>,
    config: FanoutConfig,
    shutdown: Arc<AtomicBool>,
    progress: ProgressBar,
}

impl ParallelFanoutClient {
    pub fn new(expander: Arc<RegistryQueryExpander>, config: FanoutConfig) -> Self {
        Self {
            expander,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub async fn search(&self, seeds: Vec<PostalCode>) -> SearchReport {
        let concurrency = self.config.concurrency.max(1);
        let mut state = ExpansionState::new(seeds);
        let mut batches_run = 0usize;
        let mut cancelled = false;

        while state.has_pending() && !cancelled {
            let pass = state.take_pass();
            tracing::info!(
                "fan-out pass: {} codes in batches of {}",
                pass.len(),
                concurrency
            );
            self.progress.inc_length(pass.len() as u64);
            let mut queue = pass.into_iter();

            loop {
                let batch: Vec<_> = queue.by_ref().take(concurrency).collect();
                if batch.is_empty() {
                    break;
                }
                if self.shutdown.load(Ordering::SeqCst) {
                    for node in batch.into_iter().chain(queue.by_ref()) {
                        state.cancel(node);
                    }
                    cancelled = true;
                    break;
                }
                if batches_run > 0 && !self.config.batch_delay.is_zero() {
                    sleep(self.config.batch_delay).await;
                }
                batches_run += 1;

                let mut in_flight: FuturesUnordered<_> = batch
                    .into_iter()
                    .map(|node| async move {
                        let (result, attempts) = self
                            .expander
                            .query_with_retry(&node.code, &self.config.retry)
                            .await;
                        (node, result, attempts)
                    })
                    .collect();

                while let Some((node, result, attempts)) = in_flight.next().await {
                    state.apply(node, result, attempts);
                    self.progress.inc(1);
                }
            }
        }

        if cancelled {
            for node in state.take_pass() {
                state.cancel(node);
            }
        }

        let report = state.finish();
        self.progress.finish_with_message(format!(
            "done: records={} leaves={} failed={} partial={}",
            report.records.len(),
            report.leaves_resolved,
            report.failures.len(),
            report.partial_coverage.len()
        ));
        tracing::info!(
            "fan-out done: {} records, {} leaves, {} requests over {} passes / {} batches ({} failed, {} partial)",
            report.records.len(),
            report.leaves_resolved,
            report.requests_issued,
            report.passes,
            batches_run,
            report.failures.len(),
            report.partial_coverage.len()
        );
        report
    }
}
